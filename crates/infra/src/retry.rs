//! Retry policy shared by the two retry loci: per-document inside the worker
//! and per-delivery inside the webhook dispatcher. No other layer retries.

use std::time::Duration;

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (>= 1).
    pub max_attempts: u32,
    /// Backoff base; the sleep after attempt `n` is `base * 2^(n-1)`.
    pub base_delay: Duration,
    /// Cap applied to any single backoff sleep.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Whether another attempt may follow the given 1-indexed attempt.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sleep after the given failed 1-indexed attempt: `base * 2^(attempt-1)`,
    /// capped at `max_delay`. With the 2s default this yields 2s, 4s, 8s, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn caps_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_after(8), Duration::from_secs(10));
    }

    #[test]
    fn has_next_counts_the_first_attempt() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
        assert!(policy.has_next(1));
        assert!(policy.has_next(2));
        assert!(!policy.has_next(3));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::exponential(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_next(1));
    }
}
