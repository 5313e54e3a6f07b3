//! Inspection API for the notification dispatcher
//!
//! Read-only surface: health, metrics exposition, DLQ peek, and per-status
//! anomaly counts.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use pricewire_common::db;
use pricewire_common::models::ValidatedGlitch;
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
        module: "pricewire-nd".to_string(),
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

/// GET /anomalies/status: per-status anomaly counts
pub async fn anomaly_status_counts(
    State(state): State<AppState>,
) -> Result<Json<HashMap<String, i64>>, (StatusCode, String)> {
    let counts = db::anomalies::status_counts(&state.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(counts.into_iter().collect()))
}

/// GET /glitches/recent: newest retained glitches, for the analytics surface
pub async fn recent_glitches(
    State(state): State<AppState>,
) -> Result<Json<Vec<ValidatedGlitch>>, (StatusCode, String)> {
    let glitches = db::glitches::list_recent(&state.db, 20)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(glitches))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .route("/dlq/:stream", get(dlq_peek))
        .route("/anomalies/status", get(anomaly_status_counts))
        .route("/glitches/recent", get(recent_glitches))
}
