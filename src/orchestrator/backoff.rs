//! Exponential retry delay.

use std::time::Duration;

use crate::config::BackoffConfig;

/// `base * factor^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    factor: u32,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            config.factor,
            Duration::from_millis(config.max_ms),
        )
    }
}

impl BackoffPolicy {
    /// Policy with the given base delay, growth factor and cap.
    #[must_use]
    pub fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self {
            base,
            factor: factor.max(1),
            max,
        }
    }

    /// Policy that never waits. Useful for tests.
    #[must_use]
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1, Duration::ZERO)
    }

    /// Delay before the retry that follows `failures` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let mut delay = self.base;
        for _ in 1..failures {
            if delay >= self.max {
                break;
            }
            delay = delay.saturating_mul(self.factor);
        }
        delay.min(self.max)
    }
}
