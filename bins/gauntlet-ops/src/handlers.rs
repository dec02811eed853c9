// HTTP route handlers for the ops server

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use gauntlet_engine::metrics::render_prometheus;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::AppState;

/// GET /health - 200 while the queue is healthy, 503 otherwise
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.queue.get_status();
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// GET /status - cheap queue view
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.get_status())
}

/// GET /languages - language → runtime capability matrix
pub async fn languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.orchestrator().capability_matrix())
}

/// GET /metrics - full counters
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.get_metrics())
}

/// GET /metrics/prometheus
pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_prometheus(&state.queue.get_metrics()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to render metrics" })),
            )
                .into_response()
        }
    }
}

/// POST /metrics/reset
pub async fn reset_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.queue.reset_metrics();
    info!("Metrics reset via ops endpoint");
    (StatusCode::OK, Json(json!({ "reset": true })))
}
