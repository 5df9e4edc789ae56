//! Retry + circuit breaker + per-call timeout, composed around one call site

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::BreakerRegistry;
use super::retry::RetryPolicy;
use crate::config::ResilienceConfig;
use crate::error::{Error, Result};

/// Resilience wrapper for calls that cross a process boundary.
///
/// Each attempt must pass the operation's breaker, runs under the per-call
/// timeout and reports its outcome back to the breaker. Only
/// [retryable](Error::is_retryable) failures are retried or counted against
/// the breaker; anything else is returned straight away.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    timeout: Option<Duration>,
}

impl ResiliencePolicy {
    /// Create a policy sharing `breakers` with its siblings
    pub fn new(config: &ResilienceConfig, breakers: Arc<BreakerRegistry>) -> Self {
        ResiliencePolicy {
            retry: RetryPolicy::new(&config.retry),
            breakers,
            timeout: None,
        }
    }

    /// Bound each attempt by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the retry schedule
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Breakers backing this policy
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `call` under the policy, naming it `operation` for the breaker.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(operation);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let permit = breaker.acquire()?;

            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "{} exceeded {:?}",
                        operation, limit
                    ))),
                },
                None => call().await,
            };

            match outcome {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        debug!(operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    permit.failure();
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    if let Err(open) = breaker.reject_if_open() {
                        warn!(operation, attempts = attempt, error = %e, "Circuit opened mid-retry");
                        return Err(open);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // The dependency answered; the failure is ours to surface.
                    permit.success();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, threshold: u32) -> ResiliencePolicy {
        let config = ResilienceConfig {
            retry: RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
            },
            breaker: BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
            ..ResilienceConfig::default()
        };
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        ResiliencePolicy::new(&config, breakers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let policy = policy(3, 10);
        let calls = &AtomicU32::new(0);

        let result = policy
            .call("embedding", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retries_validation() {
        let policy = policy(3, 10);
        let calls = &AtomicU32::new(0);

        let result: Result<()> = policy
            .call("store.save", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.breakers().get("store.save").consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_last_error_after_exhaustion() {
        let policy = policy(3, 10);
        let calls = &AtomicU32::new(0);

        let result: Result<()> = policy
            .call("store.search", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::StorageUnavailable("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let policy = policy(2, 10).with_timeout(Duration::from_secs(1));
        let calls = &AtomicU32::new(0);

        let result: Result<()> = policy
            .call("compression", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_fails_fast_then_probes_once() {
        let policy = policy(1, 5);
        let calls = &AtomicU32::new(0);
        let failing = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::StorageUnavailable("down".into()))
        };

        for _ in 0..5 {
            let _ = policy.call("store.save", failing).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let result = policy.call("store.save", failing).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(60)).await;
        let _ = policy.call("store.save", failing).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let result = policy.call("store.save", failing).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_stops_loop() {
        let policy = policy(3, 2);
        let calls = &AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<()> = policy
            .call("store.save", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::StorageUnavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One backoff between the two attempts, none after the breaker opened
        assert!(start.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_per_operation() {
        let policy = policy(1, 1);
        let _: Result<()> = policy
            .call("embedding", move || async move { Err(Error::Timeout("x".into())) })
            .await;

        let ok = policy.call("store.save", move || async move { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
    }
}
