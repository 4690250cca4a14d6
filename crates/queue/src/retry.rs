//! Retry backoff.

#![allow(missing_docs)]

use std::time::Duration;

use courier_common::config::QueueConfig;

/// Retry configuration with exponential backoff.
///
/// `delay(n) = min(initial_delay * 2^n, max_delay)` where `n` is the job's
/// failure count after the failure being handled.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay at a failure count of zero.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(600), // 10 minutes
            multiplier: 2.0,
        }
    }
}

impl From<&QueueConfig> for RetryConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
            ..Self::default()
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before re-running a job with `failure_count` failures.
    #[must_use]
    pub fn delay_for_attempt(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_millis((delay_secs * 1000.0).round() as u64)
    }

    /// Check if a job with `failure_count` failures may run again.
    #[must_use]
    pub const fn should_retry(failure_count: u32, max_failure_count: u32) -> bool {
        failure_count < max_failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(250));
        // First failure: 0.5s
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(256));
    }

    #[test]
    fn test_max_delay() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(11), Duration::from_secs(512));
        assert_eq!(config.delay_for_attempt(12), Duration::from_secs(600));
        assert_eq!(config.delay_for_attempt(64), Duration::from_secs(600));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_from_queue_config() {
        let config = RetryConfig::from(&QueueConfig {
            retry_initial_delay_ms: 100,
            retry_max_delay_secs: 1,
            receive_batch_size: 512,
        });

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry() {
        assert!(RetryConfig::should_retry(0, 1));
        assert!(!RetryConfig::should_retry(1, 1));
        assert!(RetryConfig::should_retry(9, 10));
        assert!(!RetryConfig::should_retry(10, 10));
    }
}
