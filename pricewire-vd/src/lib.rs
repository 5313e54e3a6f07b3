//! pricewire-vd library - AI validator daemon
//!
//! Worker D1: consumes `anomaly.detected`, routes each anomaly through the
//! weighted model router, and emits confirmed glitches to
//! `anomaly.confirmed`.

use crate::router::ModelRouter;
use axum::Router;
use pricewire_common::metrics::{DlqInspector, Metrics};
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod llm;
pub mod router;
pub mod validator;
pub mod verdict;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub metrics: Metrics,
    pub dlq: DlqInspector,
    pub router: Arc<ModelRouter>,
}

impl AppState {
    pub fn new(metrics: Metrics, dlq: DlqInspector, router: Arc<ModelRouter>) -> Self {
        Self {
            metrics,
            dlq,
            router,
        }
    }
}

/// Build the inspection API router
pub fn build_router(state: AppState) -> Router {
    api::routes().with_state(state)
}
