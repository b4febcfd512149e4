// Configuration File Support
//
// This module provides configuration file parsing for the MediChain AI gate.
// Supports TOML format with environment variable overrides.
// The file is read from `--config`, then MEDICHAIN_CONFIG, then ./medichain.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ai::retry::RetryConfig;
use crate::rate_limit::config::{GateConfig, PER_HOUR, PER_MINUTE};
use crate::rate_limit::dashboard::DashboardThresholds;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "MEDICHAIN_CONFIG";

/// Config file used when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "medichain.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Quotas and backoff for the gate
    pub gate: GateConfig,

    /// Status server configuration
    pub server: ServerConfig,

    /// Upstream AI service
    pub upstream: UpstreamConfig,

    /// Recommendation thresholds for the status endpoint
    pub dashboard: DashboardThresholds,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Upstream AI service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the generation API; unset means AI features use fallbacks
    pub base_url: Option<String>,

    /// Model name sent with each request
    pub model: String,

    /// Name of the environment variable holding the API key
    pub api_key_env: String,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,

    /// Caller-side retry of transient failures
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "MEDICHAIN_API_KEY".to_string(),
            timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl UpstreamConfig {
    /// Whether an upstream service has been configured
    pub fn is_configured(&self) -> bool {
        self.base_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults. Environment overrides are applied
    /// and the result is validated either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::debug!("Read configuration file {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file used when `--config` is not given
    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - MEDICHAIN_LOG_LEVEL
    /// - MEDICHAIN_LOG_FORMAT
    /// - MEDICHAIN_QUOTA_PER_MINUTE
    /// - MEDICHAIN_QUOTA_PER_HOUR
    /// - MEDICHAIN_PORT
    /// - MEDICHAIN_UPSTREAM_URL
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Logging overrides
        if let Some(level) = lookup("MEDICHAIN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("MEDICHAIN_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Quota overrides; unparsable or zero values are ignored
        for (key, name) in [
            ("MEDICHAIN_QUOTA_PER_MINUTE", PER_MINUTE),
            ("MEDICHAIN_QUOTA_PER_HOUR", PER_HOUR),
        ] {
            if let Some(capacity) = lookup(key).and_then(|v| v.parse::<u32>().ok()) {
                if capacity > 0 {
                    if let Some(quota) = self.gate.quota_mut(name) {
                        quota.capacity = capacity;
                    }
                }
            }
        }

        // Server overrides
        if let Some(port) = lookup("MEDICHAIN_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }

        // Upstream overrides
        if let Some(url) = lookup(crate::rate_limit::dashboard::UPSTREAM_URL_ENV) {
            self.upstream.base_url = Some(url);
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        self.gate.validate().context("Invalid gate configuration")?;

        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }

        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("Upstream timeout must be > 0");
        }
        if let Some(url) = &self.upstream.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("Upstream URL must start with http:// or https://: {}", url);
            }
        }

        if !(0.0..=100.0).contains(&self.dashboard.low_tokens_percent) {
            anyhow::bail!("Dashboard low_tokens_percent must be between 0 and 100");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
