// Exponential backoff retry logic for upstream AI calls
//
// Implements retry strategy with:
// - Exponential backoff (1s, 2s, 4s)
// - Maximum 3 retry attempts
// - Jitter to prevent thundering herd
//
// Each retry goes back through the gate, so it costs a quota token like any
// other call.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry strategy configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds (default 1000ms)
    pub base_delay_ms: u64,
    /// Maximum number of retries (default 3)
    pub max_retries: u32,
    /// Maximum delay in milliseconds (default 30000ms)
    pub max_delay_ms: u64,
    /// Add jitter to delay (default true)
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_retries: 3,
            max_delay_ms: 30_000,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry decision for a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this delay
    Retry(Duration),
    /// Give up and report the failure
    GiveUp,
}

/// Calculate retry delay based on attempt number
///
/// delay = min(base * 2^attempt, max) ± 20% jitter
///
/// `attempt` is zero-indexed (0 = first retry).
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries {
        debug!("Max retries ({}) exceeded, giving up", config.max_retries);
        return RetryDecision::GiveUp;
    }

    let delay_ms = config
        .base_delay_ms
        .saturating_mul(2_u64.saturating_pow(attempt))
        .min(config.max_delay_ms);

    let delay_ms = if config.use_jitter && delay_ms > 0 {
        let jitter = (delay_ms as f64 * 0.2) as u64;
        let mut rng = rand::rng();
        let random_jitter = rng.random_range(0..=jitter);

        if rng.random_bool(0.5) {
            delay_ms.saturating_add(random_jitter)
        } else {
            delay_ms.saturating_sub(random_jitter)
        }
    } else {
        delay_ms
    };

    debug!(attempt, delay_ms, "Scheduling upstream retry");
    RetryDecision::Retry(Duration::from_millis(delay_ms))
}
