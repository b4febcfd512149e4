//! Rate Limit Configuration
//!
//! Static configuration for the gate: quota windows, backoff parameters and
//! the background refill tick.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::error::ConfigError;

/// Default rate limits for the upstream AI service
pub const DEFAULT_PER_MINUTE_LIMIT: u32 = 15; // requests per minute
pub const DEFAULT_PER_HOUR_LIMIT: u32 = 1000; // requests per hour
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_EXPONENT: u32 = 5;
pub const DEFAULT_REFILL_TICK_MS: u64 = 1000;

/// Name of the per-minute quota
pub const PER_MINUTE: &str = "per-minute";
/// Name of the per-hour quota
pub const PER_HOUR: &str = "per-hour";

/// One quota window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Quota name, used as the key in status output
    pub name: String,

    /// Maximum tokens in one window
    pub capacity: u32,

    /// Window length in milliseconds
    pub window_ms: u64,
}

impl QuotaConfig {
    pub fn new(name: impl Into<String>, capacity: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(PER_MINUTE, capacity, Duration::from_secs(60))
    }

    pub fn per_hour(capacity: u32) -> Self {
        Self::new(PER_HOUR, capacity, Duration::from_secs(3600))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Backoff used while the worker waits for quota
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// First wait in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single wait
    pub max_delay_ms: u64,

    /// Attempt count beyond which the delay stops doubling
    pub max_exponent: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_exponent: DEFAULT_MAX_EXPONENT,
        }
    }
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Quota windows; a request needs one token from each
    pub quotas: Vec<QuotaConfig>,

    /// Backoff while waiting for tokens
    pub backoff: BackoffConfig,

    /// Background refill interval; `None` or `0` leaves refill to the worker
    pub refill_tick_ms: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quotas: vec![
                QuotaConfig::per_minute(DEFAULT_PER_MINUTE_LIMIT),
                QuotaConfig::per_hour(DEFAULT_PER_HOUR_LIMIT),
            ],
            backoff: BackoffConfig::default(),
            refill_tick_ms: Some(DEFAULT_REFILL_TICK_MS),
        }
    }
}

impl GateConfig {
    /// Create a configuration with the given quotas and default backoff
    pub fn with_quotas(quotas: Vec<QuotaConfig>) -> Self {
        Self {
            quotas,
            ..Self::default()
        }
    }

    /// Replace the backoff parameters
    pub fn backoff(mut self, base: Duration, max: Duration, max_exponent: u32) -> Self {
        self.backoff = BackoffConfig {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            max_exponent,
        };
        self
    }

    /// Disable the background refill task (refill happens lazily in the worker)
    pub fn without_refill_tick(mut self) -> Self {
        self.refill_tick_ms = None;
        self
    }

    /// Get the refill tick interval; `0` in a config file turns the ticker off
    pub fn refill_tick(&self) -> Option<Duration> {
        self.refill_tick_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Find a quota by name
    pub fn quota_mut(&mut self, name: &str) -> Option<&mut QuotaConfig> {
        self.quotas.iter_mut().find(|q| q.name == name)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns the first problem found. The gate refuses to start on any of them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quotas.is_empty() {
            return Err(ConfigError::NoQuotas);
        }

        let mut seen = HashSet::new();
        for quota in &self.quotas {
            if quota.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if quota.capacity == 0 {
                return Err(ConfigError::ZeroCapacity(quota.name.clone()));
            }
            if quota.window_ms == 0 {
                return Err(ConfigError::ZeroWindow(quota.name.clone()));
            }
            if !seen.insert(quota.name.as_str()) {
                return Err(ConfigError::DuplicateQuota(quota.name.clone()));
            }
        }

        if self.backoff.base_delay_ms == 0 {
            return Err(ConfigError::InvalidBackoff("base_delay_ms must be > 0"));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ConfigError::InvalidBackoff(
                "max_delay_ms must be >= base_delay_ms",
            ));
        }
        if self.backoff.max_exponent > 32 {
            return Err(ConfigError::InvalidBackoff("max_exponent must be <= 32"));
        }

        Ok(())
    }
}
