//! In-process cache for query embeddings
//!
//! Uses moka async cache (Send + Sync, TTL-based eviction).
//! Keys are scoped by model so switching models never serves stale vectors.

use moka::future::Cache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use crate::config::EmbeddingConfig;

fn cache_key(model: &str, text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    model.hash(&mut hasher);
    text.hash(&mut hasher);
    hasher.finish()
}

/// Embedding cache: hash(model, text) -> vector
#[derive(Clone)]
pub struct EmbeddingCache {
    model: String,
    entries: Cache<u64, Vec<f32>>,
}

impl EmbeddingCache {
    /// Create a cache holding up to `capacity` vectors for `ttl`
    pub fn new(model: impl Into<String>, capacity: u64, ttl: Duration) -> Self {
        EmbeddingCache {
            model: model.into(),
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Build from embedding settings
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(&config.model, config.cache_capacity, config.cache_ttl)
    }

    /// Get a cached embedding
    pub async fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.get(&cache_key(&self.model, text)).await
    }

    /// Store an embedding
    pub async fn put(&self, text: &str, embedding: Vec<f32>) {
        self.entries
            .insert(cache_key(&self.model, text), embedding)
            .await;
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
