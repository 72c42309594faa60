// retry.rs - Retry and Backoff Policies
//
//! Exponential backoff for transient send failures.
//!
//! The Router uses [`RetryPolicy`] between attempts on one medium; the
//! ZigBee connector uses [`contention_backoff`], a randomized slot backoff
//! suited to a shared radio channel.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per medium, including the first
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 = none, 1.0 = up to double the delay)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    ///
    /// `min(base * 2^attempt, max) * (1 + random * jitter)`, clamped to max.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = base.min(self.max_delay_ms);

        if self.jitter <= 0.0 || capped == 0 {
            return Duration::from_millis(capped);
        }

        let frac: f64 = rand::rng().random_range(0.0..1.0);
        let with_jitter = capped as f64 * (1.0 + frac * self.jitter);
        Duration::from_millis((with_jitter as u64).min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

/// Randomized slot backoff for a contended channel.
///
/// Waits a random number of slots in `[0, 2^min(attempt, 6))`, so stations
/// that collided are unlikely to pick the same slot again.
pub fn contention_backoff(slot: Duration, attempt: u32) -> Duration {
    let window = 1u32 << attempt.min(6);
    let slots = rand::rng().random_range(0..window);
    slot * slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 300,
            jitter: 1.0,
            ..RetryPolicy::default()
        };
        for attempt in 0..70 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!RetryPolicy::none().allows_retry(1));
    }

    #[test]
    fn test_contention_backoff_window() {
        let slot = Duration::from_millis(2);
        assert_eq!(contention_backoff(slot, 0), Duration::ZERO);
        for _ in 0..100 {
            assert!(contention_backoff(slot, 3) < slot * 8);
            assert!(contention_backoff(slot, 40) < slot * 64);
        }
    }
}
