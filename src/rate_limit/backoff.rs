//! Backoff while waiting for quota
//!
//! delay = min(max_delay, base_delay * 2^min(attempt, max_exponent))

use std::time::Duration;

use super::config::BackoffConfig;

/// Exponential backoff with a capped exponent and a capped delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    max_exponent: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_exponent: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_exponent,
        }
    }

    /// Delay before re-checking quota on the given zero-indexed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_exponent,
        )
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}
