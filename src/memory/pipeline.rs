//! Retrieval pipeline state machine
//!
//! `Embed -> Search -> Filter -> Compress -> Done`, with `Error` reachable from
//! any stage. Stages run strictly in sequence; each one consumes the previous
//! stage's output. Dropping the future stops the request between stages.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::compressor::{Chunk, CompressionOutcome, ContextCompressor};
use super::embedding::VectorCodec;
use super::store::{MemoryStore, SearchOptions};
use crate::config::RetrievalConfig;
use crate::core::types::ScoredTurn;
use crate::error::{Error, Result};

/// Pipeline stage, recorded in the order visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embed,
    Search,
    Filter,
    Compress,
    Done,
    Error,
}

/// How the returned context was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOutcome {
    /// The compression capability produced the text
    Compressed,
    /// The local reduction produced the text
    Fallback,
    /// Nothing relevant survived search and filtering; the text is empty
    NoMatches,
}

/// Result of one pipeline run
#[derive(Debug, Clone)]
pub struct RetrievedContext {
    /// Final context, empty when nothing matched
    pub text: String,
    /// How `text` was produced
    pub outcome: ContextOutcome,
    /// Turns returned by search, before filtering
    pub hits: usize,
    /// Stages visited
    pub stages: Vec<Stage>,
}

/// Per-request overrides; unset fields take the configured defaults
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub max_tokens: Option<usize>,
    pub max_results: Option<usize>,
    pub similarity_floor: Option<f32>,
    pub temperature: Option<f32>,
}

impl RetrieveOptions {
    /// Only override the output budget
    pub fn max_tokens(max_tokens: usize) -> Self {
        RetrieveOptions {
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }
}

enum PipelineState {
    Embed,
    Search { embedding: Vec<f32> },
    Filter { hits: Vec<ScoredTurn> },
    Compress { hits: usize, chunks: Vec<Chunk> },
    Done(RetrievedContext),
    Error(Error),
}

/// Embed, search, filter and compress, in that order
#[derive(Clone)]
pub struct RetrievalPipeline {
    codec: Arc<VectorCodec>,
    store: Arc<MemoryStore>,
    compressor: Arc<ContextCompressor>,
    defaults: RetrievalConfig,
    temperature: f32,
}

impl RetrievalPipeline {
    /// Create a new pipeline
    pub fn new(
        codec: Arc<VectorCodec>,
        store: Arc<MemoryStore>,
        compressor: Arc<ContextCompressor>,
        defaults: RetrievalConfig,
        temperature: f32,
    ) -> Self {
        Self {
            codec,
            store,
            compressor,
            defaults,
            temperature,
        }
    }

    /// Context text for `query`, bounded by `max_tokens`
    pub async fn retrieve_context(&self, query: &str, max_tokens: usize) -> Result<String> {
        Ok(self
            .retrieve(query, &RetrieveOptions::max_tokens(max_tokens))
            .await?
            .text)
    }

    /// Run the pipeline and report how the context was built.
    ///
    /// Embedding failures surface as `EmbeddingFailed` and search failures as
    /// `RetrievalUnavailable`. An open circuit surfaces as `CircuitOpen` from
    /// either stage. Compression never fails the request.
    pub async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<RetrievedContext> {
        let start = Instant::now();
        let max_tokens = options.max_tokens.unwrap_or(self.defaults.max_tokens);
        let mut stages = Vec::with_capacity(5);
        let mut state = PipelineState::Embed;

        loop {
            state = match state {
                PipelineState::Embed => {
                    stages.push(Stage::Embed);
                    self.handle_embed(query).await
                }
                PipelineState::Search { embedding } => {
                    stages.push(Stage::Search);
                    self.handle_search(&embedding, options).await
                }
                PipelineState::Filter { hits } => {
                    stages.push(Stage::Filter);
                    self.handle_filter(hits, &stages)
                }
                PipelineState::Compress { hits, chunks } => {
                    stages.push(Stage::Compress);
                    self.handle_compress(query, hits, chunks, max_tokens, options, &stages)
                        .await
                }
                PipelineState::Done(mut context) => {
                    context.stages.push(Stage::Done);
                    info!(
                        outcome = ?context.outcome,
                        hits = context.hits,
                        chars = context.text.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Retrieval complete"
                    );
                    return Ok(context);
                }
                PipelineState::Error(error) => {
                    stages.push(Stage::Error);
                    warn!(error = %error, stages = ?stages, "Retrieval failed");
                    return Err(error);
                }
            };
        }
    }

    async fn handle_embed(&self, query: &str) -> PipelineState {
        match self.codec.encode(query).await {
            Ok(embedding) => PipelineState::Search { embedding },
            Err(e @ (Error::EmbeddingFailed(_) | Error::CircuitOpen { .. })) => PipelineState::Error(e),
            Err(e) if e.is_validation() => PipelineState::Error(e),
            Err(e) => PipelineState::Error(Error::EmbeddingFailed(e.to_string())),
        }
    }

    async fn handle_search(&self, embedding: &[f32], options: &RetrieveOptions) -> PipelineState {
        let search = SearchOptions {
            limit: Some(options.max_results.unwrap_or(self.defaults.max_results)),
            session_id: None,
            similarity_floor: options.similarity_floor,
        };

        match self.store.search(embedding, &search).await {
            Ok(hits) => {
                debug!(hits = hits.len(), "Search stage complete");
                PipelineState::Filter { hits }
            }
            Err(e @ Error::CircuitOpen { .. }) => PipelineState::Error(e),
            Err(e) if e.is_validation() => PipelineState::Error(e),
            Err(e) => PipelineState::Error(Error::RetrievalUnavailable(e.to_string())),
        }
    }

    fn handle_filter(&self, hits: Vec<ScoredTurn>, stages: &[Stage]) -> PipelineState {
        let total = hits.len();
        let chunks = self.compressor.filter_chunks(
            hits.into_iter()
                .map(|h| Chunk::new(h.turn.chunk_text(), h.score))
                .collect(),
        );

        if chunks.is_empty() {
            debug!(hits = total, "No chunks survived filtering");
            return PipelineState::Done(RetrievedContext {
                text: String::new(),
                outcome: ContextOutcome::NoMatches,
                hits: total,
                stages: stages.to_vec(),
            });
        }

        PipelineState::Compress { hits: total, chunks }
    }

    async fn handle_compress(
        &self,
        query: &str,
        hits: usize,
        chunks: Vec<Chunk>,
        max_tokens: usize,
        options: &RetrieveOptions,
        stages: &[Stage],
    ) -> PipelineState {
        let temperature = options.temperature.unwrap_or(self.temperature);
        let result = self
            .compressor
            .compress(query, chunks, max_tokens, temperature)
            .await;

        let outcome = match result.outcome {
            CompressionOutcome::Compressed => ContextOutcome::Compressed,
            CompressionOutcome::Fallback => ContextOutcome::Fallback,
        };

        PipelineState::Done(RetrievedContext {
            text: result.text,
            outcome,
            hits,
            stages: stages.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, Config, RetryConfig};
    use crate::core::capability::{CompressionCapability, EmbeddingCapability, ReduceRequest};
    use crate::core::storage::{DuplicateProbe, NearestQuery, TurnBackend};
    use crate::core::types::{Metadata, NewTurn, Turn, TurnId};
    use crate::memory::InMemoryBackend;
    use crate::resilience::{BreakerRegistry, ResiliencePolicy};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Embeds known texts to fixed vectors
    struct TableEmbedder(HashMap<String, Vec<f32>>);

    #[async_trait]
    impl EmbeddingCapability for TableEmbedder {
        fn id(&self) -> &str {
            "table"
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| Error::EmbeddingFailed(format!("unknown text: {}", text)))
        }
    }

    struct FailingCompressor;

    #[async_trait]
    impl CompressionCapability for FailingCompressor {
        fn id(&self) -> &str {
            "failing"
        }
        async fn reduce(&self, _request: ReduceRequest<'_>) -> Result<String> {
            Err(Error::Timeout("model did not answer".into()))
        }
    }

    struct EchoCompressor;

    #[async_trait]
    impl CompressionCapability for EchoCompressor {
        fn id(&self) -> &str {
            "echo"
        }
        async fn reduce(&self, request: ReduceRequest<'_>) -> Result<String> {
            Ok(format!("{} chunks for {}", request.chunks.len(), request.query))
        }
    }

    /// Backend whose similarity search is always unreachable
    #[derive(Default)]
    struct SearchDownBackend {
        searches: AtomicU32,
    }

    #[async_trait]
    impl TurnBackend for SearchDownBackend {
        fn id(&self) -> &str {
            "search-down"
        }
        async fn insert(&self, _turn: &Turn) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _id: TurnId) -> Result<Option<Turn>> {
            Ok(None)
        }
        async fn nearest(&self, _query: &NearestQuery) -> Result<Vec<ScoredTurn>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Err(Error::StorageUnavailable("connection refused".into()))
        }
        async fn find_duplicates(&self, _probe: &DuplicateProbe) -> Result<Vec<Turn>> {
            Ok(Vec::new())
        }
        async fn merge_metadata(&self, _id: TurnId, _patch: &Metadata, _at: DateTime<Utc>) -> Result<bool> {
            Ok(false)
        }
        async fn delete(&self, _id: TurnId) -> Result<bool> {
            Ok(false)
        }
        async fn purge_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn health_check(&self) -> Result<()> {
            Err(Error::StorageUnavailable("connection refused".into()))
        }
    }

    const DEPLOY: &str = "How do we deploy the service to staging environment?";
    const DEPLOY_ANSWER: &str = "Run scripts/deploy.sh with the staging profile after tagging.";

    async fn pipeline(compression: Option<Arc<dyn CompressionCapability>>) -> RetrievalPipeline {
        let mut config = Config::default();
        config.embedding.dimensions = 3;
        config.resilience.retry = RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        };
        let breakers = Arc::new(BreakerRegistry::new(config.resilience.breaker.clone()));
        let policy = ResiliencePolicy::new(&config.resilience, breakers.clone());

        let embedder = TableEmbedder(HashMap::from([
            ("deploy to staging".to_string(), vec![1.0, 0.05, 0.0]),
            ("unrelated".to_string(), vec![0.0, 0.0, 1.0]),
        ]));
        let codec = VectorCodec::new(Arc::new(embedder), &config.embedding, policy.clone());

        let store = MemoryStore::new(Arc::new(InMemoryBackend::default()), &config, breakers);
        store
            .save(NewTurn::new(DEPLOY, DEPLOY_ANSWER, vec![1.0, 0.0, 0.0]).with_session("A"))
            .await
            .unwrap();
        store
            .save(NewTurn::new("ok", "", vec![0.9, 0.1, 0.0]).with_session("B"))
            .await
            .unwrap();

        let compressor = ContextCompressor::new(compression, &config.compression, policy);
        RetrievalPipeline::new(
            Arc::new(codec),
            Arc::new(store),
            Arc::new(compressor),
            config.retrieval.clone(),
            config.compression.temperature,
        )
    }

    #[tokio::test]
    async fn test_compressed_context() {
        let pipeline = pipeline(Some(Arc::new(EchoCompressor))).await;
        let context = pipeline
            .retrieve("deploy to staging", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(context.outcome, ContextOutcome::Compressed);
        assert_eq!(context.hits, 2);
        assert_eq!(context.text, "1 chunks for deploy to staging");
        assert_eq!(
            context.stages,
            vec![Stage::Embed, Stage::Search, Stage::Filter, Stage::Compress, Stage::Done]
        );
    }

    #[tokio::test]
    async fn test_compression_failure_still_returns_text() {
        let pipeline = pipeline(Some(Arc::new(FailingCompressor))).await;
        let text = pipeline
            .retrieve_context("deploy to staging", 500)
            .await
            .unwrap();

        assert!(!text.is_empty());
        assert!(text.contains(DEPLOY_ANSWER));
    }

    #[tokio::test]
    async fn test_no_matches_skips_compression() {
        let pipeline = pipeline(Some(Arc::new(EchoCompressor))).await;
        let context = pipeline
            .retrieve("unrelated", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(context.outcome, ContextOutcome::NoMatches);
        assert!(context.text.is_empty());
        assert!(!context.stages.contains(&Stage::Compress));
    }

    #[tokio::test]
    async fn test_embedding_failure_is_fatal() {
        let pipeline = pipeline(None).await;
        let err = pipeline
            .retrieve("never seen", &RetrieveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_failure_maps_to_retrieval_unavailable_then_circuit_open() {
        let mut config = Config::default();
        config.embedding.dimensions = 3;
        config.resilience.retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            ..RetryConfig::default()
        };
        config.resilience.breaker = BreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        };
        let breakers = Arc::new(BreakerRegistry::new(config.resilience.breaker.clone()));
        let policy = ResiliencePolicy::new(&config.resilience, breakers.clone());

        let embedder = TableEmbedder(HashMap::from([(
            "deploy to staging".to_string(),
            vec![1.0, 0.05, 0.0],
        )]));
        let codec = VectorCodec::new(Arc::new(embedder), &config.embedding, policy.clone());
        let backend = Arc::new(SearchDownBackend::default());
        let store = MemoryStore::new(backend.clone(), &config, breakers);
        let compressor = ContextCompressor::new(None, &config.compression, policy);
        let pipeline = RetrievalPipeline::new(
            Arc::new(codec),
            Arc::new(store),
            Arc::new(compressor),
            config.retrieval.clone(),
            config.compression.temperature,
        );

        let err = pipeline
            .retrieve("deploy to staging", &RetrieveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalUnavailable(_)));
        assert_eq!(backend.searches.load(Ordering::SeqCst), 2);

        let err = pipeline
            .retrieve("deploy to staging", &RetrieveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(backend.searches.load(Ordering::SeqCst), 2);
    }
}
