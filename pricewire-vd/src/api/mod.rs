//! Inspection API for the validator daemon
//!
//! Read-only surface: health, metrics exposition, DLQ peek, and per-model
//! router stats.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "pricewire-vd".to_string(),
    })
}

/// GET /metrics: text exposition derived from `metrics.` KV keys
pub async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.render().await {
        Ok(body) => body.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct DlqEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct DlqResponse {
    pub stream: String,
    pub size: i64,
    pub entries: Vec<DlqEntry>,
}

/// GET /dlq/:stream: size and the oldest entries of a dead-letter stream
pub async fn dlq_peek(
    State(state): State<AppState>,
    Path(stream): Path<String>,
) -> Result<Json<DlqResponse>, (StatusCode, String)> {
    let size = state
        .dlq
        .size(&stream)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let entries = state
        .dlq
        .peek(&stream, 20)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(DlqResponse {
        stream,
        size,
        entries: entries
            .into_iter()
            .map(|e| DlqEntry {
                id: e.id.to_string(),
                fields: e.fields,
            })
            .collect(),
    }))
}

/// GET /router/stats: effective weights, counters, and circuit states
pub async fn router_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.stats().await)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .route("/dlq/:stream", get(dlq_peek))
        .route("/router/stats", get(router_stats))
}
