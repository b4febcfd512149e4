//! MediChain AI Gate Library
//!
//! Admission control for calls to a rate-limited AI service: per-minute and
//! per-hour quotas, a FIFO queue drained by a single worker, a status
//! endpoint for monitoring, and a gated generation client with local fallback.

pub mod ai;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod status_server;
