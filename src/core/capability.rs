//! Capability traits - Abstract interfaces for the external model services
//!
//! OpenRecall never embeds text or summarizes context itself; it calls out to
//! an embedding capability and a generative compression capability. Both are
//! traits so a deployment can plug in any HTTP API (or a test double).

use async_trait::async_trait;

use crate::error::Result;

/// Turns text into a fixed-length vector
#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    /// Capability identifier, used in logs and breaker names
    fn id(&self) -> &str;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Input to a compression call
#[derive(Debug, Clone, Copy)]
pub struct ReduceRequest<'a> {
    /// The query the context is being built for
    pub query: &'a str,
    /// Retrieved chunks, most similar first
    pub chunks: &'a [String],
    /// Output budget
    pub max_tokens: usize,
    /// Sampling temperature
    pub temperature: f32,
}

/// Reduces retrieved chunks plus a query into a bounded synthesized context
#[async_trait]
pub trait CompressionCapability: Send + Sync {
    /// Capability identifier, used in logs and breaker names
    fn id(&self) -> &str;

    /// Produce the compressed context
    async fn reduce(&self, request: ReduceRequest<'_>) -> Result<String>;
}
