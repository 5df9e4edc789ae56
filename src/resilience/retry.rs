//! Retry with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff schedule.
///
/// The delay before retry `r` (r = 1 for the second attempt) is
/// `initial_delay * 2^(r-1)`, capped at `max_delay`, then scaled by a random
/// factor in `[0.5, 1.0]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build from configuration
    pub fn new(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
        }
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `retry` without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry `retry` with jitter applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        self.base_delay(retry).mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_base_delay_doubles() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_base_delay_is_capped() {
        let p = policy();
        assert_eq!(p.base_delay(5), Duration::from_secs(1));
        assert_eq!(p.base_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy();
        for retry in 1..=4 {
            let base = p.base_delay(retry);
            for _ in 0..50 {
                let d = p.delay_for(retry);
                assert!(d >= base / 2, "{:?} below half of {:?}", d, base);
                assert!(d <= base);
            }
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let p = RetryPolicy::new(&RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        assert_eq!(p.max_attempts(), 1);
    }
}
