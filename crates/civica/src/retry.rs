//! Per-step retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff with jitter for transient step failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total forward attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before the attempt numbered `attempt` (1-based; the first
    /// retry is attempt 2). Doubles per attempt, capped at `max_delay`,
    /// with up to 50% added jitter to spread contending sagas.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        let jitter_ms = base.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }

        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        for _ in 0..20 {
            // attempt 2: 100ms base, up to +50% jitter
            let d2 = policy.backoff(2);
            assert!(d2 >= Duration::from_millis(100) && d2 <= Duration::from_millis(150));

            // attempt 5: 800ms base
            let d5 = policy.backoff(5);
            assert!(d5 >= Duration::from_millis(800) && d5 <= Duration::from_millis(1200));

            // far attempts stay capped at max_delay + jitter
            let d9 = policy.backoff(9);
            assert!(d9 <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn none_never_waits() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff(2), Duration::ZERO);
    }
}
