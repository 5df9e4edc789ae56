//! Error types for OpenRecall

use std::time::Duration;
use thiserror::Error;

/// Result type alias using OpenRecall's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OpenRecall
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (never retried)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding length differs from the configured dimension (never retried)
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Durable store unreachable after all retries
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Search could not run, so no context can be produced
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Circuit breaker is open for the named operation
    #[error("Circuit open for '{operation}', retry in {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    /// Embedding capability failed
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Compression capability failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// A single external call exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream HTTP status that is not a success
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment variable error
    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted after `MemoryService::shutdown`
    #[error("Service is shut down")]
    ServiceClosed,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Bad input shape; `DimensionMismatch` counts as a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::DimensionMismatch { .. })
    }

    /// Check if error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::StorageUnavailable(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Upstream { status, .. } => *status == 429 || *status >= 500,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Infrastructure is unreachable, as opposed to bad input or an empty result
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_)
                | Error::RetrievalUnavailable(_)
                | Error::CircuitOpen { .. }
                | Error::ServiceClosed
        )
    }
}

impl From<humantime::DurationError> for Error {
    fn from(err: humantime::DurationError) -> Self {
        Error::Config(err.to_string())
    }
}
