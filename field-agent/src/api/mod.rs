//! Local HTTP API for the field agent.

pub mod health;
pub mod status;
pub mod sync;

use crate::resilience::ResilienceLayer;
use crate::supervisor::SupervisorHandle;
use crate::ws::{EventBus, SyncTotals};
use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent_id: Arc<str>,
    pub started_at: DateTime<Utc>,
    pub sync: Arc<dyn SupervisorHandle>,
    pub mount: Option<Arc<dyn SupervisorHandle>>,
    pub resilience: Arc<ResilienceLayer>,
    pub events: EventBus,
    pub totals: Arc<SyncTotals>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/status", get(status::status))
        .route("/sync/now", post(sync::sync_now))
        .route("/sync/pause", post(sync::pause))
        .route("/sync/resume", post(sync::resume))
        .route("/sync/start", post(sync::start))
        .route("/mount/start", post(sync::start_mount))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
