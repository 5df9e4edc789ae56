//! Memory store: validated, deduplicated and resilient access to turns
//!
//! Every backend round trip runs under its own named breaker:
//! `store.save`, `store.search`, `store.find_duplicates`, `store.get`,
//! `store.enrich`, `store.delete` and `store.purge`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::dedup::{DedupDecision, DedupGuard, Fingerprints};
use crate::config::{Config, RetrievalConfig};
use crate::core::storage::{NearestQuery, TurnBackend};
use crate::core::types::{Metadata, NewTurn, ScoredTurn, Turn, TurnId};
use crate::error::{Error, Result};
use crate::resilience::{BreakerRegistry, ResiliencePolicy};

/// What `save` did with a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new row was written
    Inserted(TurnId),
    /// A recent turn in the same session already held this content
    Deduplicated(TurnId),
}

impl SaveOutcome {
    /// Id of the row now holding the turn
    pub fn id(&self) -> TurnId {
        match self {
            SaveOutcome::Inserted(id) | SaveOutcome::Deduplicated(id) => *id,
        }
    }

    /// Whether a new row was written
    pub fn is_inserted(&self) -> bool {
        matches!(self, SaveOutcome::Inserted(_))
    }
}

/// Per-call search parameters; unset fields take the configured defaults
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Result cap, clamped to the configured ceiling
    pub limit: Option<usize>,
    /// `None` searches the whole corpus
    pub session_id: Option<String>,
    /// Minimum similarity
    pub similarity_floor: Option<f32>,
}

impl SearchOptions {
    /// Search everything with at most `limit` results
    pub fn limit(limit: usize) -> Self {
        SearchOptions {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Restrict to one session
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Override the similarity floor
    pub fn with_floor(mut self, floor: f32) -> Self {
        self.similarity_floor = Some(floor);
        self
    }
}

/// Durable store of conversational turns
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<dyn TurnBackend>,
    policy: ResiliencePolicy,
    dedup: DedupGuard,
    dimensions: usize,
    retrieval: RetrievalConfig,
}

impl MemoryStore {
    /// Create a store over `backend`, sharing `breakers` with the rest of the service
    pub fn new(backend: Arc<dyn TurnBackend>, config: &Config, breakers: Arc<BreakerRegistry>) -> Self {
        let policy = ResiliencePolicy::new(&config.resilience, breakers)
            .with_timeout(config.resilience.store_timeout);
        let dedup = DedupGuard::new(backend.clone(), policy.clone(), &config.dedup);

        MemoryStore {
            backend,
            policy,
            dedup,
            dimensions: config.embedding.dimensions,
            retrieval: config.retrieval.clone(),
        }
    }

    /// Configured embedding dimension
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Backend identifier
    pub fn backend_id(&self) -> &str {
        self.backend.id()
    }

    /// Dedup guard used by `save`
    pub fn dedup(&self) -> &DedupGuard {
        &self.dedup
    }

    /// Check a turn against the storage invariants
    pub fn validate(&self, turn: &NewTurn) -> Result<()> {
        if turn.user_input.trim().is_empty() && turn.assistant_response.trim().is_empty() {
            return Err(Error::Validation(
                "turn needs a user input or an assistant response".into(),
            ));
        }
        if turn.embedding.is_empty() {
            return Err(Error::Validation("turn embedding is required".into()));
        }
        self.check_vector(&turn.embedding)
    }

    fn check_vector(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("embedding contains non-finite values".into()));
        }
        Ok(())
    }

    /// Save a turn and return the id of the row holding it
    pub async fn save(&self, turn: NewTurn) -> Result<TurnId> {
        Ok(self.save_with_outcome(turn).await?.id())
    }

    /// Save a turn, reporting whether it was written or deduplicated
    pub async fn save_with_outcome(&self, mut turn: NewTurn) -> Result<SaveOutcome> {
        self.validate(&turn)?;

        let now = Utc::now();
        let fingerprints = Fingerprints::compute(&turn.user_input, &turn.assistant_response, now);

        let decision = self
            .dedup
            .check(&turn, &fingerprints, now)
            .await
            .map_err(|e| unavailable("find_duplicates", e))?;
        if let DedupDecision::Skip { existing } = decision {
            return Ok(SaveOutcome::Deduplicated(existing));
        }

        turn.metadata
            .insert(Metadata::CONTENT_HASH, fingerprints.content_hash);
        turn.metadata
            .insert(Metadata::TIME_AWARE_HASH, fingerprints.time_aware_hash);
        let turn = Turn::from_new(turn, now);

        self.policy
            .call("store.save", || self.backend.insert(&turn))
            .await
            .map_err(|e| unavailable("save", e))?;

        info!(turn_id = %turn.id, session_id = ?turn.session_id, "Turn saved");
        Ok(SaveOutcome::Inserted(turn.id))
    }

    /// Turns most similar to `embedding`, best first
    pub async fn search(&self, embedding: &[f32], options: &SearchOptions) -> Result<Vec<ScoredTurn>> {
        self.check_vector(embedding)?;

        let limit = options
            .limit
            .unwrap_or(self.retrieval.max_results)
            .min(self.retrieval.max_results_ceiling);
        let floor = options
            .similarity_floor
            .unwrap_or(self.retrieval.similarity_floor);
        if !(-1.0..=1.0).contains(&floor) {
            return Err(Error::Validation(format!(
                "similarity floor {} is outside [-1, 1]",
                floor
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = NearestQuery {
            embedding: embedding.to_vec(),
            limit,
            session_id: options.session_id.clone(),
            floor,
            mode: self.retrieval.index_mode,
            probes: self.retrieval.probes,
        };

        let hits = self
            .policy
            .call("store.search", || self.backend.nearest(&query))
            .await
            .map_err(|e| unavailable("search", e))?;

        debug!(
            hits = hits.len(),
            limit,
            floor,
            session_id = ?options.session_id,
            "Search complete"
        );
        Ok(hits)
    }

    /// Fetch a turn by id
    pub async fn get(&self, id: TurnId) -> Result<Option<Turn>> {
        self.policy
            .call("store.get", || self.backend.get(id))
            .await
            .map_err(|e| unavailable("get", e))
    }

    /// Additively merge `patch` into a turn's metadata.
    ///
    /// Fingerprint keys in the patch are ignored. Returns false for unknown ids.
    pub async fn enrich(&self, id: TurnId, patch: &Metadata) -> Result<bool> {
        let now = Utc::now();
        let found = self
            .policy
            .call("store.enrich", || self.backend.merge_metadata(id, patch, now))
            .await
            .map_err(|e| unavailable("enrich", e))?;

        if found {
            debug!(turn_id = %id, keys = patch.len(), "Turn metadata enriched");
        }
        Ok(found)
    }

    /// Delete one turn; returns whether it existed
    pub async fn delete(&self, id: TurnId) -> Result<bool> {
        let existed = self
            .policy
            .call("store.delete", || self.backend.delete(id))
            .await
            .map_err(|e| unavailable("delete", e))?;

        if existed {
            info!(turn_id = %id, "Turn deleted");
        }
        Ok(existed)
    }

    /// Delete turns created before `older_than`; returns the count removed
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let removed = self
            .policy
            .call("store.purge", || self.backend.purge_before(older_than))
            .await
            .map_err(|e| unavailable("purge", e))?;

        info!(removed, cutoff = %older_than, "Purged old turns");
        Ok(removed)
    }

    /// Single round trip to the backend, outside the retry policy
    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }
}

/// Transient failures that survived every retry mean the store is unreachable.
fn unavailable(operation: &str, err: Error) -> Error {
    if err.is_retryable() && !matches!(err, Error::StorageUnavailable(_)) {
        Error::StorageUnavailable(format!("{}: {}", operation, err))
    } else {
        err
    }
}
