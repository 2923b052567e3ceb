//! Retry backoff with jitter
//!
//! `delay(k) = min(base_delay * exponential_base^k, max_delay) + uniform(0, 0.1 * that)`

use crate::config::RetryConfig;
use std::time::Duration;

/// Jitter added on top of the capped delay, as a fraction of it
const JITTER_FRACTION: f64 = 0.1;

/// Backoff policy applied to failed job attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exponential_base: f64,
    pub max_delay: Duration,
    /// Attempts granted to newly enqueued jobs
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            exponential_base: config.exponential_base,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retrying after failed attempt `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }

    /// Un-jittered delay for `attempt`
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Delay for `attempt` with `sample` in `[0, 1)` choosing the jitter
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let capped = self.capped_delay(attempt);
        capped + capped.mul_f64(JITTER_FRACTION * sample.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
    }

    #[test]
    fn test_exponential_growth() {
        let policy = policy();
        assert_eq!(policy.capped_delay(0), Duration::from_secs(1));
        assert_eq!(policy.capped_delay(1), Duration::from_secs(2));
        assert_eq!(policy.capped_delay(2), Duration::from_secs(4));
        assert_eq!(policy.capped_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        assert_eq!(policy().capped_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_extremes() {
        let policy = policy();
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_secs(2));
        let max = policy.delay_with_jitter(1, 1.0).as_secs_f64();
        assert!((max - 2.2).abs() < 1e-6, "got {max}");
    }

    proptest! {
        #[test]
        fn prop_delay_within_jitter_bounds(
            attempt in 0u32..40,
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            exp in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                exponential_base: exp,
                max_delay: Duration::from_millis(max_ms),
                max_attempts: 5,
            };
            let expected = (base_ms as f64 / 1000.0 * exp.powi(attempt as i32))
                .min(max_ms as f64 / 1000.0);
            let delay = policy.delay(attempt).as_secs_f64();

            prop_assert!(delay >= expected - 1e-6);
            prop_assert!(delay <= expected * 1.1 + 1e-6);
        }
    }
}
