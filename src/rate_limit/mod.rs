//! Rate Limiting and Admission Control Module
//!
//! This module guards calls to the upstream AI service with per-minute and
//! per-hour quotas. Excess demand is queued FIFO and admitted as tokens come
//! back, instead of being rejected.
//!
//! # Features
//!
//! - Fixed-window quotas refilled per elapsed window
//! - Single drain worker that owns the queue and admits one request at a time
//! - Exponential backoff while quota is exhausted
//! - Optional per-request deadline and drop-to-cancel
//! - Status snapshot and operator recommendations for monitoring
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RateLimitedGate                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  execute() ──► FIFO queue ──► Drain Worker ──► operation()  │
//! │                                   │                         │
//! │  ┌─────────────┐  ┌─────────────┐ │  ┌──────────────────┐   │
//! │  │ per-minute  │  │ per-hour    │◄┘  │ Refill Ticker    │   │
//! │  │ Quota       │  │ Quota       │◄───┤ (optional)       │   │
//! │  └─────────────┘  └─────────────┘    └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gate;
pub mod quota;
pub mod request;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{BackoffConfig, GateConfig, QuotaConfig};
pub use dashboard::{DashboardBuilder, DashboardThresholds, StatusReport};
pub use error::{ConfigError, GateError};
pub use gate::{GateStatus, RateLimitedGate};
pub use quota::{Quota, QuotaStatus};
pub use request::{Outcome, PendingRequest};
