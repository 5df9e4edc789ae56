//! Memory module - store, similarity search and the retrieval pipeline
//!
//! Turns are validated, deduplicated and persisted by [`MemoryStore`] over a
//! pluggable backend. [`RetrievalPipeline`] embeds a query with
//! [`VectorCodec`], searches the whole corpus and hands the hits to the
//! [`ContextCompressor`].

pub mod cache;
pub mod compressor;
pub mod dedup;
pub mod embedding;
pub mod in_memory;
pub mod index;
pub mod pipeline;
pub mod store;

pub use cache::EmbeddingCache;
pub use compressor::{ChatCompressionClient, Chunk, Compressed, CompressionOutcome, ContextCompressor};
pub use dedup::{DedupDecision, DedupGuard, Fingerprints};
pub use embedding::{HttpEmbeddingClient, VectorCodec};
pub use in_memory::InMemoryBackend;
pub use index::{cosine_similarity, IvfIndex};
pub use pipeline::{ContextOutcome, RetrievalPipeline, RetrieveOptions, RetrievedContext, Stage};
pub use store::{MemoryStore, SaveOutcome, SearchOptions};
