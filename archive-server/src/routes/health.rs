use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use field_agent::protocol::{HealthResponse, HEALTH_ROUTE};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        files: state.cached_file_count().await,
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::tests::{test_state, write};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use field_agent::protocol::HealthResponse;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn get_health(app: axum::Router) -> HealthResponse {
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_cached_file_count() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.png", "a");
        write(dir.path(), "b/c.png", "c");
        let state = test_state(dir.path(), &[]);

        let before = get_health(create_router(state.clone())).await;
        assert_eq!(before.status, "ok");
        assert_eq!(before.files, None);

        state.manifest().await.unwrap();
        let after = get_health(create_router(state)).await;
        assert_eq!(after.files, Some(2));
    }
}
