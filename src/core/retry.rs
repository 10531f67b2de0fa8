//! Retry policy for submissions rejected by backpressure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff applied when a non-blocking submit hits a full queue.
///
/// Only [`crate::core::PoolError::QueueFull`] is retried. A closed pool is
/// reported to the caller on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based), or
    /// `None` once attempts are exhausted.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Some(Duration::from_millis(ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        };
        let delays: Vec<_> = (1..=6).map(|a| policy.backoff(a)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(10)),
                Some(Duration::from_millis(20)),
                Some(Duration::from_millis(40)),
                Some(Duration::from_millis(50)),
                Some(Duration::from_millis(50)),
                None,
            ]
        );
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(RetryPolicy::no_retry().backoff(1), None);
    }

    #[test]
    fn test_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5));
        assert_eq!(policy.backoff(1), Some(Duration::from_millis(5)));
        assert_eq!(policy.backoff(2), Some(Duration::from_millis(5)));
        assert_eq!(policy.backoff(3), None);
    }
}
