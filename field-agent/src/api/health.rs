//! Health check endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": state.agent_id.as_ref(),
        "uptime_secs": uptime,
        "online": state.resilience.is_online(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["zstd", "tar"],
    }))
}
