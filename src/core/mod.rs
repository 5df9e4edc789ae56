//! Core module - Fundamental traits and types for OpenRecall
//!
//! - Turn and metadata types
//! - Capability traits for the embedding and compression services
//! - The storage trait implemented by persistence backends

pub mod capability;
pub mod storage;
pub mod types;

pub use capability::{CompressionCapability, EmbeddingCapability, ReduceRequest};
pub use storage::{DuplicateProbe, NearestQuery, TurnBackend};
pub use types::*;
