pub mod archive;
pub mod health;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(archive::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::config::AppConfig;
    use crate::state::AppState;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    pub fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    pub fn test_state(root: &Path, extensions: &[&str]) -> Arc<AppState> {
        Arc::new(AppState::new(AppConfig {
            port: 0,
            archive_root: root.to_path_buf(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            manifest_ttl: Duration::from_secs(60),
            log_level: "info".to_string(),
        }))
    }
}
