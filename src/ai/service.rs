//! AI Assistant Service
//!
//! Routes every upstream call through the [`RateLimitedGate`], retries
//! transient failures, and falls back to canned local guidance when the
//! upstream is missing or keeps failing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{Completion, UpstreamError};
use super::retry::{calculate_retry_delay, RetryConfig, RetryDecision};
use crate::metrics;
use crate::rate_limit::{GateError, RateLimitedGate};

/// Where generated text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Upstream,
    Fallback,
}

/// Text returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub source: Source,
}

/// Gated access to the upstream AI service
#[derive(Clone)]
pub struct AssistantService {
    gate: RateLimitedGate,
    client: Option<Arc<dyn Completion>>,
    retry: RetryConfig,
}

impl std::fmt::Debug for AssistantService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantService")
            .field("configured", &self.client.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AssistantService {
    pub fn new(
        gate: RateLimitedGate,
        client: Option<Arc<dyn Completion>>,
        retry: RetryConfig,
    ) -> Self {
        Self { gate, client, retry }
    }

    /// Whether an upstream client is available
    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn gate(&self) -> &RateLimitedGate {
        &self.gate
    }

    /// Generate text upstream, retrying transient failures
    ///
    /// Each attempt waits its turn in the gate and consumes a token.
    pub async fn generate(&self, prompt: &str) -> Result<String, GateError<UpstreamError>> {
        let client = match &self.client {
            Some(client) => Arc::clone(client),
            None => return Err(GateError::Upstream(UpstreamError::NotConfigured)),
        };

        let mut attempt = 0;
        loop {
            let client = Arc::clone(&client);
            let prompt_owned = prompt.to_string();
            let result = self
                .gate
                .execute("generate", move || async move {
                    client.complete(&prompt_owned).await
                })
                .await;

            match result {
                Ok(text) => {
                    metrics::UPSTREAM_CALLS_TOTAL.with_label_values(&["ok"]).inc();
                    return Ok(text);
                }
                Err(GateError::Upstream(err)) => {
                    metrics::UPSTREAM_CALLS_TOTAL.with_label_values(&["error"]).inc();
                    if !err.is_retryable() {
                        warn!(error = %err, "Upstream call failed");
                        return Err(GateError::Upstream(err));
                    }
                    match calculate_retry_delay(attempt, &self.retry) {
                        RetryDecision::Retry(delay) => {
                            debug!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Retrying upstream call");
                            metrics::UPSTREAM_RETRIES_TOTAL.inc();
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            warn!(attempts = attempt + 1, error = %err, "Upstream call failed after retries");
                            return Err(GateError::Upstream(err));
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Generate text, substituting local guidance on any failure
    pub async fn generate_or_fallback(&self, prompt: &str) -> Generation {
        match self.generate(prompt).await {
            Ok(text) => Generation {
                text,
                source: Source::Upstream,
            },
            Err(err) => {
                if err.is_upstream() {
                    info!(error = %err, "Upstream failed; using local fallback text");
                } else {
                    warn!(error = %err, "Gate did not deliver a result; using local fallback text");
                }
                Generation {
                    text: fallback_text(prompt),
                    source: Source::Fallback,
                }
            }
        }
    }
}

/// Canned guidance chosen by keyword
pub fn fallback_text(prompt: &str) -> String {
    let prompt = prompt.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| prompt.contains(w));

    let text = if has(&["sleep", "tired", "insomnia"]) {
        "Aim for 7-9 hours of sleep and keep a regular bedtime, even on weekends."
    } else if has(&["water", "hydrat", "drink"]) {
        "Drink water regularly through the day; thirst is a late signal of dehydration."
    } else if has(&["exercise", "walk", "activity", "workout"]) {
        "Try for at least 150 minutes of moderate activity per week, such as brisk walking."
    } else if has(&["diet", "food", "eat", "nutrition"]) {
        "Fill half your plate with vegetables and fruit, and prefer whole grains."
    } else if has(&["stress", "anxiety", "mood"]) {
        "Short breathing exercises and a daily walk can help manage stress."
    } else {
        "AI insights are temporarily unavailable. Keep logging your health data and check back soon."
    };
    text.to_string()
}
