//! Circuit breaker per named operation
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(timeout elapses)--> HALF_OPEN
//! HALF_OPEN --(probe succeeds)--> CLOSED
//! HALF_OPEN --(probe fails)--> OPEN
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{Error, Result};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
}

/// Tracks consecutive failures of one operation and fails fast while open
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Operation name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to make a call. Fails with `CircuitOpen` while open or while the
    /// half-open probe is already in flight.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();

        match inner.state {
            State::Closed => Ok(BreakerPermit::new(self, false)),
            State::Open { until } if now < until => Err(self.open_error(until - now)),
            State::Open { .. } => {
                info!(operation = %self.name, "Circuit half-open, allowing probe");
                inner.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(BreakerPermit::new(self, true))
            }
            State::HalfOpen {
                probe_in_flight: true,
            } => Err(self.open_error(Duration::ZERO)),
            State::HalfOpen {
                probe_in_flight: false,
            } => {
                inner.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(BreakerPermit::new(self, true))
            }
        }
    }

    /// Fail with `CircuitOpen` if the breaker is open and still cooling down.
    /// Takes no permit.
    pub fn reject_if_open(&self) -> Result<()> {
        match self.lock().state {
            State::Open { until } => {
                let now = Instant::now();
                if now < until {
                    Err(self.open_error(until - now))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            operation: self.name.clone(),
            retry_after,
        }
    }

    fn record_success(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !matches!(inner.state, State::Closed) {
            info!(operation = %self.name, "Circuit closed");
        }
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
    }

    fn record_failure(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let until = Instant::now() + self.recovery_timeout;

        match inner.state {
            State::Closed if inner.consecutive_failures >= self.failure_threshold => {
                warn!(
                    operation = %self.name,
                    failures = inner.consecutive_failures,
                    recovery_timeout = ?self.recovery_timeout,
                    "Circuit opened"
                );
                inner.state = State::Open { until };
            }
            State::HalfOpen { .. } => {
                warn!(operation = %self.name, "Probe failed, circuit re-opened");
                inner.state = State::Open { until };
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let State::HalfOpen { probe_in_flight } = &mut inner.state {
            *probe_in_flight = false;
        }
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        match self.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures recorded since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}

/// Admission to call through a breaker. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping an
/// unreported probe permit (e.g. a cancelled request) frees the probe slot.
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        BreakerPermit {
            breaker,
            probe,
            reported: false,
        }
    }

    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The dependency answered
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    /// The dependency failed transiently
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Named breakers shared process-wide
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new(config: BreakerConfig) -> Self {
        BreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the breaker for `operation`
    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, &self.config)))
            .clone()
    }

    /// State of every breaker created so far, sorted by name
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
