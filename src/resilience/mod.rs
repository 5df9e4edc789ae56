//! Resilience module - retry with backoff and circuit breaking
//!
//! Applied around every call that leaves the process: the embedding API,
//! the compression API and each store round trip.

pub mod circuit_breaker;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{BreakerPermit, BreakerRegistry, BreakerState, CircuitBreaker};
pub use policy::ResiliencePolicy;
pub use retry::RetryPolicy;
