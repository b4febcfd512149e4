//! Upstream Generation Client
//!
//! Thin HTTP client for a Gemini-style `generateContent` endpoint. The client
//! knows nothing about quotas; callers go through the gate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::UpstreamConfig;

/// Failure talking to the upstream AI service
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("upstream request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected upstream response: {0}")]
    InvalidResponse(String),

    #[error("upstream AI service is not configured")]
    NotConfigured,
}

impl UpstreamError {
    /// Whether the same call might succeed if tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Timeout | Self::Network(_) => true,
            Self::InvalidResponse(_) | Self::NotConfigured => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        408 | // Request Timeout
        429 | // Too Many Requests
        500 | // Internal Server Error
        502 | // Bad Gateway
        503 | // Service Unavailable
        504   // Gateway Timeout
    )
}

/// Something that turns a prompt into text
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, UpstreamError>;
}

/// HTTP client for the upstream generation API
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    /// Build a client from configuration
    ///
    /// The API key is read from the environment variable named in the config.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or(UpstreamError::NotConfigured)?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl Completion for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
        let url = self.endpoint();
        debug!(url = %url, prompt_len = prompt.len(), "Sending generation request");

        let mut request = self.http_client.post(&url).json(&request_body(prompt));
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(UpstreamError::from_reqwest)?;

        if status != StatusCode::OK {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::InvalidResponse(format!("invalid JSON: {}", e)))?;
        extract_text(&value)
    }
}

/// Request body for a single-turn prompt
pub fn request_body(prompt: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": prompt }]
        }]
    })
}

/// Pull the generated text out of a response
pub fn extract_text(response: &Value) -> Result<String, UpstreamError> {
    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| UpstreamError::InvalidResponse("no candidates in response".to_string()))?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        return Err(UpstreamError::InvalidResponse("empty candidate text".to_string()));
    }
    Ok(text)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
