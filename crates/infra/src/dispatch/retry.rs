//! Backoff policy for transient sink failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base * 2^(retry - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
    /// `base * retry`, capped at `max_delay`.
    Linear,
}

/// How often and how patiently a lane re-sends a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = deliver once).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Spread applied around the computed delay, as a fraction of it.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-indexed). `retry == 0` is the
    /// first attempt and never waits.
    ///
    /// Jitter is derived from `retry` and `salt` so two lanes failing at
    /// the same moment do not retry in lockstep, while a given
    /// `(retry, salt)` always yields the same delay.
    pub fn delay_for_attempt(&self, retry: u32, salt: u64) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi(retry.saturating_sub(1).min(62) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        let spread = delay_ms * self.jitter;
        let offset = if spread > 0.0 {
            let unit = (u64::from(retry).wrapping_mul(17).wrapping_add(salt) % 100) as f64 / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(strategy: BackoffStrategy, max_attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_doubles_until_the_cap() {
        let policy = policy(BackoffStrategy::Exponential, 8, 100, 1000);
        let delays: Vec<u64> = (1..=6).map(|r| policy.delay_for_attempt(r, 0).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn linear_and_fixed() {
        let linear = policy(BackoffStrategy::Linear, 5, 50, 120);
        assert_eq!(linear.delay_for_attempt(2, 0), Duration::from_millis(100));
        assert_eq!(linear.delay_for_attempt(3, 0), Duration::from_millis(120));

        let fixed = policy(BackoffStrategy::Fixed, 3, 75, 75);
        assert_eq!(fixed.delay_for_attempt(1, 9), fixed.delay_for_attempt(3, 4));
    }

    #[test]
    fn first_attempt_never_waits() {
        assert_eq!(policy(BackoffStrategy::Exponential, 5, 200, 10_000).delay_for_attempt(0, 42), Duration::ZERO);
    }

    #[test]
    fn retry_budget() {
        let policy = policy(BackoffStrategy::Fixed, 2, 1, 1);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let once = RetryPolicy { max_attempts: 0, ..policy.clone() };
        assert!(!once.should_retry(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn jitter_stays_within_its_spread(retry in 1u32..40, salt in any::<u64>(), jitter in 0.0f64..=1.0) {
            let bare = policy(BackoffStrategy::Exponential, 50, 100, 5000);
            let jittered = RetryPolicy { jitter, ..bare.clone() };
            let expected = bare.delay_for_attempt(retry, salt).as_millis() as f64;
            let got = jittered.delay_for_attempt(retry, salt).as_millis() as f64;
            prop_assert!(got <= expected * (1.0 + jitter) + 1.0);
            prop_assert!(got + 1.0 >= expected * (1.0 - jitter));
        }
    }
}
