//! Manual sync control endpoints.

use super::AppState;
use crate::resilience::{NetworkError, Outcome, Priority};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use futures_util::FutureExt;
use serde_json::json;
use tracing::info;

/// POST /sync/now - Run a sync as soon as possible
///
/// Goes through the resilience layer: when the link is down the request is
/// queued at high priority and replayed once connectivity returns.
pub async fn sync_now(State(state): State<AppState>) -> impl IntoResponse {
    let task = state.sync.clone();
    let outcome = state
        .resilience
        .submit(Priority::High, move || {
            let task = task.clone();
            async move {
                task.trigger();
                Ok::<(), NetworkError>(())
            }
            .boxed()
        })
        .await;

    match outcome {
        Outcome::Success(()) => {
            info!("Manual sync triggered");
            (StatusCode::ACCEPTED, Json(json!({ "status": "triggered" })))
        }
        Outcome::Queued(id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "operation_id": id })),
        ),
        Outcome::Failed(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// POST /sync/pause
pub async fn pause(State(state): State<AppState>) -> impl IntoResponse {
    state.sync.pause();
    Json(json!({ "status": state.sync.state() }))
}

/// POST /sync/resume
pub async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    state.sync.resume();
    Json(json!({ "status": state.sync.state() }))
}

/// POST /sync/start - Restart the sync task, the way out of `error`
pub async fn start(State(state): State<AppState>) -> impl IntoResponse {
    state.sync.start().await;
    Json(json!({ "status": state.sync.state() }))
}

/// POST /mount/start
pub async fn start_mount(State(state): State<AppState>) -> impl IntoResponse {
    match &state.mount {
        Some(mount) => {
            mount.start().await;
            (StatusCode::OK, Json(json!({ "status": mount.state() })))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "mount supervision is disabled" })),
        ),
    }
}
