// HTTP server for gate status and AI generation
//
// Routes:
// - GET  /status   gate snapshot with recommendations (JSON)
// - GET  /health   liveness check
// - GET  /metrics  Prometheus text format
// - POST /generate gated AI generation with local fallback

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ai::AssistantService;
use crate::config::ServerConfig;
use crate::metrics;
use crate::rate_limit::dashboard::{DashboardBuilder, DashboardThresholds, StatusReport};

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    dashboard: DashboardBuilder,
    assistant: AssistantService,
}

impl AppState {
    pub fn new(assistant: AssistantService, thresholds: DashboardThresholds) -> Self {
        let dashboard = DashboardBuilder::new(assistant.gate().clone()).with_thresholds(thresholds);
        Self {
            dashboard,
            assistant,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/generate", post(generate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the status HTTP server and run until Ctrl-C
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind status server on {}", addr))?;
    info!("Status server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Status server error")?;

    info!("Status server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Status endpoint handler
async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.dashboard.build(state.assistant.is_configured()))
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Generation endpoint handler
async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "prompt must not be empty" })),
        )
            .into_response();
    }

    let generation = state.assistant.generate_or_fallback(&request.prompt).await;
    Json(generation).into_response()
}
