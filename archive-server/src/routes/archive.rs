use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use field_agent::manifest::{validate_relative_path, Manifest};
use field_agent::protocol::{BatchRequest, BATCH_CONTENT_TYPE, BATCH_ROUTE, MANIFEST_ROUTE};
use field_agent::transfer::archive::pack_batch;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(MANIFEST_ROUTE, get(manifest))
        .route(BATCH_ROUTE, post(batch))
        .with_state(state)
}

async fn manifest(State(state): State<Arc<AppState>>) -> Result<Json<Manifest>, AppError> {
    let manifest = state.manifest().await?;
    Ok(Json(manifest.as_ref().clone()))
}

/// Pack the requested files into one zstd-compressed tar.
///
/// Only files listed in the current manifest are served. Anything else is
/// left out of the archive, which the agent records as a missing entry.
async fn batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    for path in &request.files {
        validate_relative_path(path)?;
    }

    let manifest = state.manifest().await?;
    let (files, unknown): (Vec<String>, Vec<String>) = request
        .files
        .into_iter()
        .partition(|path| manifest.get(path).is_some());
    if !unknown.is_empty() {
        tracing::debug!("{} requested file(s) not in manifest", unknown.len());
    }

    let root = state.config.archive_root.clone();
    let (body, summary) = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        pack_batch(&root, &files, &mut buf).map(|summary| (buf, summary))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(
        "Packed batch: {} files, {} bytes ({} on the wire, {} absent)",
        summary.packed,
        summary.bytes,
        body.len(),
        summary.absent + unknown.len()
    );

    Ok(([(header::CONTENT_TYPE, BATCH_CONTENT_TYPE)], body))
}
