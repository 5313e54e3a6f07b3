//! pricewire-nd library - tiered notification dispatcher
//!
//! Worker D2: consumes `anomaly.confirmed`, schedules per-tier delayed
//! fan-out jobs, and delivers through the channel provider set.

use axum::Router;
use pricewire_common::metrics::{DlqInspector, Metrics};
use sqlx::SqlitePool;

pub mod api;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod policy;
pub mod rate_limit;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub metrics: Metrics,
    pub dlq: DlqInspector,
}

impl AppState {
    pub fn new(db: SqlitePool, metrics: Metrics, dlq: DlqInspector) -> Self {
        Self { db, metrics, dlq }
    }
}

/// Build the inspection API router
pub fn build_router(state: AppState) -> Router {
    api::routes().with_state(state)
}
