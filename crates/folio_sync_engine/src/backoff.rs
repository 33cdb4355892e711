//! Stateful retry backoff.

use crate::config::RetryConfig;
use std::time::Duration;

/// A per-operation exponential backoff instance.
///
/// Tracks how many attempts a single logical operation has failed in a row
/// and produces the next delay to wait before retrying. Reset on success.
/// One `Backoff` belongs to exactly one retrying operation; instances are
/// never shared between operations.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    /// Creates a backoff from a retry configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay to wait before the next
    /// attempt, or `None` when the attempts are exhausted and the failure
    /// must be escalated.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.config.max_attempts {
            return None;
        }
        Some(self.config.delay_for_attempt(self.failures))
    }

    /// Clears the failure counter after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Returns how many failures have been recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_grow_until_exhausted() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(10))
            .with_backoff_multiplier(2.0)
            .without_jitter();
        let mut backoff = Backoff::new(config);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn reset_restarts_schedule() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .without_jitter();
        let mut backoff = Backoff::new(config);

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn unbounded_never_exhausts() {
        let config = RetryConfig::unbounded()
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter();
        let mut backoff = Backoff::new(config);

        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(
            failures in 1u32..40,
            initial_ms in 1u64..1000,
            max_ms in 1u64..60_000,
        ) {
            let config = RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .without_jitter();
            let mut backoff = Backoff::new(config);

            let mut last = Duration::ZERO;
            for _ in 0..failures {
                last = backoff.next_delay().unwrap();
            }
            prop_assert!(last <= Duration::from_millis(max_ms.max(initial_ms)));
        }
    }
}
