//! Upstream AI access
//!
//! The HTTP client, caller-side retry policy, and the service that ties them
//! to the rate-limited gate.

pub mod client;
pub mod retry;
pub mod service;

pub use client::{Completion, HttpCompletionClient, UpstreamError};
pub use retry::RetryConfig;
pub use service::{AssistantService, Generation, Source};
