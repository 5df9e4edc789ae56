//! # OpenRecall
//!
//! Conversational memory engine: persists user/assistant turns with their
//! embeddings and retrieves the most relevant prior turns for a new query.
//!
//! ## Features
//!
//! - **Durable Turn Store:** PostgreSQL + pgvector, or a process-local backend
//! - **Session-Scoped Dedup:** content and hour-bucketed fingerprints
//! - **Corpus-Wide Search:** cosine ranking, exact or approximate
//! - **Context Compression:** external model with a deterministic local fallback
//! - **Resilience:** retry with jittered backoff and per-operation circuit breakers

pub mod config;
pub mod core;
pub mod database;
pub mod error;
pub mod memory;
pub mod resilience;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use service::{MemoryService, SearchQuery, ServiceStatus};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
