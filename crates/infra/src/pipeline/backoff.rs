//! Backoff policies for connection attempts and failed flushes.

use std::time::Duration;

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed (including the first)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(u32::MAX, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Connect-with-retry policy: `step * attempt`, uncapped.
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            max_delay: Duration::MAX,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay after the given attempt (1-indexed). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    /// True while `attempt` (attempts made so far) leaves room for another.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn linear_backoff_grows_by_step() {
        let policy = RetryPolicy::linear(10, Duration::from_secs(2));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(attempt in 0u32..200, base_ms in 1u64..10_000) {
            let cap = Duration::from_secs(60);
            let policy = RetryPolicy::exponential(u32::MAX, Duration::from_millis(base_ms), cap);
            prop_assert!(policy.delay_for_attempt(attempt) <= cap);
        }
    }
}
