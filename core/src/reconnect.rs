//! Bounded reconnect with exponential backoff
//!
//! The first reconnect after an unexpected disconnect is immediate; each
//! further attempt waits `initial_delay * multiplier^(n-1)`, capped at
//! `max_delay`. Once `max_attempts` have been spent the peer is unreachable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum reconnect attempts per outage
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(capped as u64)
    }

    /// Whether attempt `attempt` (0-based) is still within budget
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_attempt_immediate() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(20), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_bounded(attempt in 1u32..64) {
            let policy = ReconnectPolicy::default();
            let here = policy.delay_for(attempt);
            let next = policy.delay_for(attempt + 1);

            prop_assert!(next >= here);
            prop_assert!(next <= Duration::from_millis(policy.max_delay_ms));
        }
    }
}
