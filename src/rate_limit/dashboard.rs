//! Status Dashboard Support
//!
//! Builds the payload served by the status endpoint: the gate snapshot, the
//! upstream readiness flag, and human-readable recommendations derived from
//! simple threshold rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::gate::{GateStatus, RateLimitedGate};
use super::quota::QuotaStatus;

/// Thresholds for the recommendation rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DashboardThresholds {
    /// Warn when a quota has this percentage of capacity or less left
    pub low_tokens_percent: f64,

    /// Warn when this many requests are waiting
    pub queue_backlog: usize,
}

impl Default for DashboardThresholds {
    fn default() -> Self {
        Self {
            low_tokens_percent: 20.0,
            queue_backlog: 5,
        }
    }
}

/// Status payload for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Timestamp of report generation
    pub timestamp: DateTime<Utc>,

    /// Whether the upstream AI service is configured
    pub service_ready: bool,

    /// Tokens per quota
    pub quotas: BTreeMap<String, QuotaStatus>,

    /// Requests waiting for admission
    pub queue_length: usize,

    /// Whether the drain worker is busy
    pub is_draining: bool,

    /// Operator-facing warnings
    pub recommendations: Vec<String>,
}

/// Environment variable that configures the upstream AI service
pub const UPSTREAM_URL_ENV: &str = "MEDICHAIN_UPSTREAM_URL";

/// Message used when no rule fires
pub const ALL_NOMINAL: &str = "All systems nominal";

/// Dashboard builder for constructing status reports
#[derive(Debug, Clone)]
pub struct DashboardBuilder {
    gate: RateLimitedGate,
    thresholds: DashboardThresholds,
}

impl DashboardBuilder {
    /// Create a new dashboard builder
    pub fn new(gate: RateLimitedGate) -> Self {
        Self {
            gate,
            thresholds: DashboardThresholds::default(),
        }
    }

    /// Use custom thresholds
    pub fn with_thresholds(mut self, thresholds: DashboardThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Build a status report
    pub fn build(&self, service_ready: bool) -> StatusReport {
        build_report(self.gate.status(), service_ready, &self.thresholds)
    }
}

/// Assemble a report from a gate snapshot
pub fn build_report(
    status: GateStatus,
    service_ready: bool,
    thresholds: &DashboardThresholds,
) -> StatusReport {
    let recommendations = recommendations(&status, service_ready, thresholds);
    StatusReport {
        timestamp: Utc::now(),
        service_ready,
        quotas: status.quotas,
        queue_length: status.queue_length,
        is_draining: status.is_draining,
        recommendations,
    }
}

/// Derive warnings from a gate snapshot
pub fn recommendations(
    status: &GateStatus,
    service_ready: bool,
    thresholds: &DashboardThresholds,
) -> Vec<String> {
    let mut out = Vec::new();

    if !service_ready {
        out.push(format!(
            "AI service is not configured; set {UPSTREAM_URL_ENV} to enable AI features"
        ));
    }

    for (name, quota) in &status.quotas {
        if quota.available == 0 {
            out.push(format!(
                "{name} quota exhausted; requests are waiting for refill"
            ));
        } else if quota.available_percent() <= thresholds.low_tokens_percent {
            out.push(format!(
                "{name} tokens nearly exhausted ({}/{} remaining)",
                quota.available, quota.capacity
            ));
        }
    }

    if status.queue_length >= thresholds.queue_backlog {
        out.push(format!(
            "Request queue backing up ({} pending); expect added latency",
            status.queue_length
        ));
    }

    if out.is_empty() {
        out.push(ALL_NOMINAL.to_string());
    }
    out
}
