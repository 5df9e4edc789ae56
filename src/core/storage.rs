//! Storage trait - Abstract interface for the durable turn store
//!
//! `MemoryStore` owns validation, dedup and resilience; a [`TurnBackend`] only
//! performs single atomic row operations. Two backends ship with the crate:
//! - `PgTurnBackend`: PostgreSQL + pgvector
//! - `InMemoryBackend`: process-local, exact or IVF-style approximate scan

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::IndexMode;
use crate::core::types::{Metadata, ScoredTurn, Turn, TurnId};
use crate::error::Result;

/// A nearest-neighbour request as seen by a backend
#[derive(Debug, Clone)]
pub struct NearestQuery {
    /// Query vector, already dimension-checked
    pub embedding: Vec<f32>,
    /// Maximum rows to return
    pub limit: usize,
    /// `None` searches the whole corpus
    pub session_id: Option<String>,
    /// Minimum cosine similarity
    pub floor: f32,
    /// Exact scan or approximate probe
    pub mode: IndexMode,
    /// Lists probed in approximate mode
    pub probes: usize,
}

/// Lookup for recent turns carrying the same fingerprints
#[derive(Debug, Clone)]
pub struct DuplicateProbe {
    /// Dedup is always session-scoped
    pub session_id: String,
    /// Content fingerprint of the candidate
    pub content_hash: String,
    /// Time-bucketed fingerprint of the candidate
    pub time_aware_hash: String,
    /// Only turns created at or after this instant
    pub since: DateTime<Utc>,
}

/// Abstract interface for turn persistence
///
/// Every method is one round trip and one atomic row operation; callers wrap
/// them in the resilience policy.
#[async_trait]
pub trait TurnBackend: Send + Sync {
    /// Get the backend ID
    fn id(&self) -> &str;

    /// Insert a fully materialized turn
    async fn insert(&self, turn: &Turn) -> Result<()>;

    /// Fetch a turn by id
    async fn get(&self, id: TurnId) -> Result<Option<Turn>>;

    /// Candidates ordered by descending similarity, ties broken by recency
    async fn nearest(&self, query: &NearestQuery) -> Result<Vec<ScoredTurn>>;

    /// Turns in the probe's session matching either fingerprint since `since`
    async fn find_duplicates(&self, probe: &DuplicateProbe) -> Result<Vec<Turn>>;

    /// Additively merge metadata; returns false if the id does not exist
    async fn merge_metadata(
        &self,
        id: TurnId,
        patch: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete one turn; returns whether it existed
    async fn delete(&self, id: TurnId) -> Result<bool>;

    /// Delete turns created before `cutoff`; returns the count removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Health check
    async fn health_check(&self) -> Result<()>;
}
