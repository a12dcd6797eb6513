//! Exponential backoff for retryable source failures.

use rand::Rng;
use std::time::Duration;

/// Retry policy with exponential backoff and optional jitter.
///
/// The delay doubles with each attempt: 1s → 2s → 4s, capped at `max_delay_ms`.
/// Jitter adds 0-25% so users sharing a tick do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    jitter_enabled: bool,
}

impl RetryPolicy {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            max_retries,
            jitter_enabled: true,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Create a policy with jitter disabled (useful for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let backoff_power = attempt.saturating_sub(1).min(8);
        let exponential = self.initial_delay_ms.saturating_mul(1 << backoff_power);
        let capped = exponential.min(self.max_delay_ms);

        if self.jitter_enabled && capped > 0 {
            let jitter = (capped as f64 * rand::thread_rng().gen::<f64>() * 0.25) as u64;
            capped + jitter
        } else {
            capped
        }
    }

    pub fn calculate_delay_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt))
    }

    /// Returns `true` if `attempt <= max_retries`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

impl Default for RetryPolicy {
    /// One retry after ~1 second, never longer than 10 seconds.
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_retries: 1,
            jitter_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = RetryPolicy::new(1_000, 5_000, 4).without_jitter();
        assert_eq!(policy.calculate_delay(1), 1_000);
        assert_eq!(policy.calculate_delay(2), 2_000);
        assert_eq!(policy.calculate_delay(3), 4_000);
        assert_eq!(policy.calculate_delay(4), 5_000);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::new(1_000, 10_000, 3);
        for _ in 0..100 {
            let delay = policy.calculate_delay(1);
            assert!((1_000..=1_250).contains(&delay));
        }
    }

    #[test]
    fn test_should_retry_is_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
