//! Process-local turn backend
//!
//! Keeps turns in a `tokio::sync::RwLock`-guarded map. Each operation takes the
//! lock once, so writes are atomic and searches see a consistent snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::index::{self, IvfIndex};
use crate::config::IndexMode;
use crate::core::storage::{DuplicateProbe, NearestQuery, TurnBackend};
use crate::core::types::{Metadata, ScoredTurn, Turn, TurnId};
use crate::error::{Error, Result};

struct Inner {
    turns: HashMap<TurnId, Turn>,
    ivf: IvfIndex,
}

/// In-memory [`TurnBackend`] with exact and IVF-style approximate search
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
}

impl InMemoryBackend {
    /// Create an empty backend; `lists` sizes the approximate index
    pub fn new(lists: usize) -> Self {
        InMemoryBackend {
            inner: RwLock::new(Inner {
                turns: HashMap::new(),
                ivf: IvfIndex::new(lists),
            }),
        }
    }

    /// Number of stored turns
    pub async fn len(&self) -> usize {
        self.inner.read().await.turns.len()
    }

    /// Whether no turns are stored
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.turns.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl TurnBackend for InMemoryBackend {
    fn id(&self) -> &str {
        "in-memory"
    }

    async fn insert(&self, turn: &Turn) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.turns.contains_key(&turn.id) {
            return Err(Error::Internal(format!("duplicate turn id {}", turn.id)));
        }
        inner.ivf.insert(turn.id, &turn.embedding);
        inner.turns.insert(turn.id, turn.clone());
        Ok(())
    }

    async fn get(&self, id: TurnId) -> Result<Option<Turn>> {
        Ok(self.inner.read().await.turns.get(&id).cloned())
    }

    async fn nearest(&self, query: &NearestQuery) -> Result<Vec<ScoredTurn>> {
        let inner = self.inner.read().await;

        let in_scope = |turn: &Turn| match &query.session_id {
            Some(session) => turn.session_id.as_deref() == Some(session.as_str()),
            None => true,
        };
        let score = |turn: &Turn| ScoredTurn {
            turn: turn.clone(),
            score: index::cosine_similarity(&query.embedding, &turn.embedding),
        };

        let candidates: Vec<ScoredTurn> = match query.mode {
            IndexMode::Exact => inner.turns.values().filter(|t| in_scope(*t)).map(score).collect(),
            IndexMode::Approximate => inner
                .ivf
                .candidates(&query.embedding, query.probes)
                .iter()
                .filter_map(|id| inner.turns.get(id))
                .filter(|t| in_scope(*t))
                .map(score)
                .collect(),
        };

        Ok(index::rank(candidates, query.limit, query.floor))
    }

    async fn find_duplicates(&self, probe: &DuplicateProbe) -> Result<Vec<Turn>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Turn> = inner
            .turns
            .values()
            .filter(|t| t.session_id.as_deref() == Some(probe.session_id.as_str()))
            .filter(|t| t.created_at >= probe.since)
            .filter(|t| {
                t.metadata.content_hash() == Some(probe.content_hash.as_str())
                    || t.metadata.time_aware_hash() == Some(probe.time_aware_hash.as_str())
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn merge_metadata(
        &self,
        id: TurnId,
        patch: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.turns.get_mut(&id) {
            Some(turn) => {
                turn.metadata.merge_additive(patch);
                turn.updated_at = updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: TurnId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.ivf.remove(&id);
        Ok(inner.turns.remove(&id).is_some())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let expired: Vec<TurnId> = inner
            .turns
            .values()
            .filter(|t| t.created_at < cutoff)
            .map(|t| t.id)
            .collect();

        for id in &expired {
            inner.turns.remove(id);
            inner.ivf.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NewTurn;
    use chrono::Duration;

    fn turn(embedding: Vec<f32>, session: Option<&str>) -> Turn {
        let mut new = NewTurn::new("question", "answer", embedding);
        new.session_id = session.map(String::from);
        Turn::from_new(new, Utc::now())
    }

    fn query(embedding: Vec<f32>, limit: usize, mode: IndexMode) -> NearestQuery {
        NearestQuery {
            embedding,
            limit,
            session_id: None,
            floor: 0.0,
            mode,
            probes: 1,
        }
    }

    #[tokio::test]
    async fn test_nearest_respects_session_scope() {
        let backend = InMemoryBackend::default();
        let a = turn(vec![1.0, 0.0], Some("A"));
        let b = turn(vec![1.0, 0.1], Some("B"));
        backend.insert(&a).await.unwrap();
        backend.insert(&b).await.unwrap();

        let all = backend.nearest(&query(vec![1.0, 0.0], 10, IndexMode::Exact)).await.unwrap();
        assert_eq!(all.len(), 2);

        let mut scoped = query(vec![1.0, 0.0], 10, IndexMode::Exact);
        scoped.session_id = Some("B".into());
        let hits = backend.nearest(&scoped).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].turn.id, b.id);
    }

    #[tokio::test]
    async fn test_approximate_hits_pass_exact_floor() {
        let backend = InMemoryBackend::new(2);
        for embedding in [
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.95, 0.05],
            vec![0.1, 0.9],
        ] {
            backend.insert(&turn(embedding, None)).await.unwrap();
        }

        let mut approx = query(vec![1.0, 0.0], 10, IndexMode::Approximate);
        approx.floor = 0.5;
        let mut exact = approx.clone();
        exact.mode = IndexMode::Exact;

        let approx_hits = backend.nearest(&approx).await.unwrap();
        let exact_hits = backend.nearest(&exact).await.unwrap();

        assert!(!approx_hits.is_empty());
        for hit in &approx_hits {
            assert!(hit.score >= approx.floor);
            let exact_hit = exact_hits
                .iter()
                .find(|h| h.turn.id == hit.turn.id)
                .expect("approximate hit missing from exact scan");
            assert_eq!(exact_hit.score, hit.score);
        }

        // A tight limit still only returns turns that clear the floor
        approx.limit = 1;
        let top = backend.nearest(&approx).await.unwrap();
        assert!(top.len() <= 1);
        assert!(top.iter().all(|h| h.score >= approx.floor));
    }

    #[tokio::test]
    async fn test_purge_before() {
        let backend = InMemoryBackend::default();
        let mut old = turn(vec![1.0, 0.0], None);
        old.created_at = Utc::now() - Duration::days(30);
        backend.insert(&old).await.unwrap();
        backend.insert(&turn(vec![0.0, 1.0], None)).await.unwrap();

        let cutoff = Utc::now() - Duration::days(1);
        assert_eq!(backend.purge_before(cutoff).await.unwrap(), 1);
        assert_eq!(backend.purge_before(cutoff).await.unwrap(), 0);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_merge_metadata_unknown_id() {
        let backend = InMemoryBackend::default();
        let merged = backend
            .merge_metadata(uuid::Uuid::new_v4(), &Metadata::new(), Utc::now())
            .await
            .unwrap();
        assert!(!merged);
    }
}
