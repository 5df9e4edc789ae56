//! Memory service - the entry point callers construct and own
//!
//! Wires store, codec, compressor and pipeline together over shared breakers.
//! Lifecycle is explicit: construct ([`MemoryService::new`] or
//! [`MemoryService::connect`]), check [`ready`](MemoryService::ready), then
//! [`shutdown`](MemoryService::shutdown). Calls after shutdown fail with
//! `ServiceClosed`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::core::capability::{CompressionCapability, EmbeddingCapability};
use crate::core::storage::TurnBackend;
use crate::core::types::{embedding_text, Metadata, NewTurn, ScoredTurn, Turn, TurnId};
use crate::database::{init_pool, PgTurnBackend, PostgresPool};
use crate::error::{Error, Result};
use crate::memory::{
    ChatCompressionClient, ContextCompressor, HttpEmbeddingClient, MemoryStore, RetrievalPipeline,
    RetrieveOptions, RetrievedContext, SaveOutcome, SearchOptions, VectorCodec,
};
use crate::resilience::{BreakerRegistry, BreakerState, ResiliencePolicy};

/// Search by text (embedded first) or by a ready vector
#[derive(Debug, Clone, Copy)]
pub enum SearchQuery<'a> {
    Text(&'a str),
    Embedding(&'a [f32]),
}

/// Health report
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Backend identifier
    pub backend: String,
    /// Whether the backend answered a health check
    pub reachable: bool,
    /// Health check failure, if any
    pub error: Option<String>,
    /// State of every breaker used so far
    pub breakers: Vec<(String, BreakerState)>,
    /// Whether `shutdown` has been called
    pub closed: bool,
}

/// Conversational memory service
pub struct MemoryService {
    config: Config,
    store: Arc<MemoryStore>,
    codec: Arc<VectorCodec>,
    pipeline: RetrievalPipeline,
    breakers: Arc<BreakerRegistry>,
    pool: Option<PostgresPool>,
    closed: AtomicBool,
}

impl MemoryService {
    /// Assemble a service from explicit collaborators
    pub fn new(
        config: Config,
        backend: Arc<dyn TurnBackend>,
        embedder: Arc<dyn EmbeddingCapability>,
        compression: Option<Arc<dyn CompressionCapability>>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(BreakerRegistry::new(config.resilience.breaker.clone()));
        let policy = ResiliencePolicy::new(&config.resilience, breakers.clone());

        let store = Arc::new(MemoryStore::new(backend, &config, breakers.clone()));
        let codec = Arc::new(VectorCodec::new(embedder, &config.embedding, policy.clone()));
        let compressor = Arc::new(ContextCompressor::new(compression, &config.compression, policy));
        let pipeline = RetrievalPipeline::new(
            codec.clone(),
            store.clone(),
            compressor,
            config.retrieval.clone(),
            config.compression.temperature,
        );

        Ok(MemoryService {
            config,
            store,
            codec,
            pipeline,
            breakers,
            pool: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to PostgreSQL and the configured HTTP capabilities
    pub async fn connect(config: Config) -> Result<Self> {
        config.require_database()?;

        let pool = init_pool(&config.database).await?;
        let backend = Arc::new(PgTurnBackend::new(pool.clone()));
        let embedder = Arc::new(HttpEmbeddingClient::new(&config.embedding)?);
        let compression: Option<Arc<dyn CompressionCapability>> = if config.compression.enabled {
            Some(Arc::new(ChatCompressionClient::new(&config.compression)?))
        } else {
            None
        };

        let mut service = Self::new(config, backend, embedder, compression)?;
        service.pool = Some(pool);

        info!(
            backend = service.store.backend_id(),
            dimensions = service.codec.dimensions(),
            "Memory service connected"
        );
        Ok(service)
    }

    /// Verify the backend is reachable
    pub async fn ready(&self) -> Result<()> {
        self.ensure_open()?;
        self.store
            .health_check()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))
    }

    /// Stop accepting calls and release the connection pool
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!("Memory service shut down");
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ServiceClosed)
        } else {
            Ok(())
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Save a turn with a caller-supplied embedding
    pub async fn save(&self, turn: NewTurn) -> Result<TurnId> {
        self.ensure_open()?;
        self.store.save(turn).await
    }

    /// Save a turn, reporting whether it was written or deduplicated
    pub async fn save_with_outcome(&self, turn: NewTurn) -> Result<SaveOutcome> {
        self.ensure_open()?;
        self.store.save_with_outcome(turn).await
    }

    /// Embed an exchange, then save it
    pub async fn save_text(
        &self,
        session_id: Option<String>,
        user_input: &str,
        assistant_response: &str,
        metadata: Metadata,
    ) -> Result<SaveOutcome> {
        self.ensure_open()?;
        if user_input.trim().is_empty() && assistant_response.trim().is_empty() {
            return Err(Error::Validation(
                "turn needs a user input or an assistant response".into(),
            ));
        }

        let embedding = self
            .codec
            .encode(&embedding_text(user_input, assistant_response))
            .await?;

        let mut turn = NewTurn::new(user_input, assistant_response, embedding).with_metadata(metadata);
        turn.session_id = session_id;
        self.store.save_with_outcome(turn).await
    }

    /// Most similar turns, best first
    pub async fn search(&self, query: SearchQuery<'_>, options: &SearchOptions) -> Result<Vec<ScoredTurn>> {
        self.ensure_open()?;
        match query {
            SearchQuery::Embedding(embedding) => self.store.search(embedding, options).await,
            SearchQuery::Text(text) => {
                let embedding = self.codec.encode(text).await?;
                self.store.search(&embedding, options).await
            }
        }
    }

    /// Full pipeline with a trace of how the context was built
    pub async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<RetrievedContext> {
        self.ensure_open()?;
        self.pipeline.retrieve(query, options).await
    }

    /// Full pipeline, context text only
    pub async fn retrieve_context(&self, query: &str, max_tokens: usize) -> Result<String> {
        self.ensure_open()?;
        self.pipeline.retrieve_context(query, max_tokens).await
    }

    /// Fetch a turn by id
    pub async fn get(&self, id: TurnId) -> Result<Option<Turn>> {
        self.ensure_open()?;
        self.store.get(id).await
    }

    /// Additively merge metadata into a committed turn
    pub async fn enrich(&self, id: TurnId, patch: Value) -> Result<bool> {
        self.ensure_open()?;
        let patch = Metadata::try_from(patch)?;
        self.store.enrich(id, &patch).await
    }

    /// Delete one turn
    pub async fn delete(&self, id: TurnId) -> Result<bool> {
        self.ensure_open()?;
        self.store.delete(id).await
    }

    /// Delete turns created before `older_than`
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.ensure_open()?;
        self.store.purge(older_than).await
    }

    /// Delete turns older than the configured retention age
    pub async fn purge_expired(&self) -> Result<u64> {
        let max_age = self
            .config
            .retention
            .max_age
            .ok_or_else(|| Error::Config("retention.max_age is not set".into()))?;
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::Config(format!("retention.max_age out of range: {}", e)))?;
        self.purge(Utc::now() - max_age).await
    }

    /// Backend reachability and breaker states
    pub async fn status(&self) -> ServiceStatus {
        let health = self.store.health_check().await;
        ServiceStatus {
            backend: self.store.backend_id().to_string(),
            reachable: health.is_ok(),
            error: health.err().map(|e| e.to_string()),
            breakers: self.breakers.snapshot(),
            closed: self.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Deterministic 3-dimensional embedder keyed on a few topic words
    struct TopicEmbedder;

    #[async_trait]
    impl EmbeddingCapability for TopicEmbedder {
        fn id(&self) -> &str {
            "topic"
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let text = text.to_lowercase();
            let score = |word: &str| -> f32 { if text.contains(word) { 1.0 } else { 0.01 } };
            Ok(vec![score("deploy"), score("database"), score("test")])
        }
    }

    fn service(config: Config) -> MemoryService {
        MemoryService::new(
            config,
            Arc::new(InMemoryBackend::default()),
            Arc::new(TopicEmbedder),
            None,
        )
        .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.dimensions = 3;
        config
    }

    #[tokio::test]
    async fn test_save_text_then_search_text() {
        let service = service(config());
        let outcome = service
            .save_text(
                Some("s1".into()),
                "how do we deploy",
                "with the deploy script",
                Metadata::new(),
            )
            .await
            .unwrap();

        let hits = service
            .search(SearchQuery::Text("deploy"), &SearchOptions::limit(5))
            .await
            .unwrap();
        assert_eq!(hits[0].turn.id, outcome.id());
    }

    #[tokio::test]
    async fn test_save_text_rejects_empty_turn() {
        let service = service(config());
        let err = service
            .save_text(None, " ", "", Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_retrieve_context_without_compression_uses_fallback() {
        let service = service(config());
        service
            .save_text(
                None,
                "How do we deploy the billing service?",
                "Tag the release, then run the deploy pipeline for billing.",
                Metadata::new(),
            )
            .await
            .unwrap();

        let context = service.retrieve("deploy", &RetrieveOptions::default()).await.unwrap();
        assert_eq!(context.outcome, crate::memory::ContextOutcome::Fallback);
        assert!(context.text.contains("deploy pipeline"));
    }

    #[tokio::test]
    async fn test_enrich_rejects_non_object_patch() {
        let service = service(config());
        let id = service
            .save(NewTurn::new("q", "a", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();

        assert!(service.enrich(id, json!({"source": "hook"})).await.unwrap());
        assert!(matches!(
            service.enrich(id, json!("nope")).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_requires_retention() {
        let service = service(config());
        assert!(matches!(service.purge_expired().await, Err(Error::Config(_))));

        let mut config = config();
        config.retention.max_age = Some(Duration::from_secs(3600));
        let service = self::service(config);
        service
            .save(NewTurn::new("q", "a", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(service.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let service = service(config());
        service.ready().await.unwrap();

        service
            .save(NewTurn::new("q", "a", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        let status = service.status().await;
        assert!(status.reachable);
        assert_eq!(status.backend, "in-memory");
        assert!(status
            .breakers
            .iter()
            .any(|(name, state)| name == "store.save" && *state == BreakerState::Closed));

        service.shutdown().await;
        assert!(service.is_closed());
        assert!(matches!(service.ready().await, Err(Error::ServiceClosed)));
        assert!(matches!(
            service.save(NewTurn::new("q", "a", vec![1.0, 0.0, 0.0])).await,
            Err(Error::ServiceClosed)
        ));
    }
}
