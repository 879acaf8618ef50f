mod config;
mod error;
mod routes;
mod state;

use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    if !config.archive_root.is_dir() {
        anyhow::bail!(
            "Archive root {} is not a directory",
            config.archive_root.display()
        );
    }
    tracing::info!(
        "Starting archive server v{} on port {}",
        env!("CARGO_PKG_VERSION"),
        config.port
    );
    tracing::info!("Serving {}", config.archive_root.display());

    let state = Arc::new(AppState::new(config.clone()));

    // Warm the manifest so the first agent does not wait on a full hash
    if let Err(e) = state.manifest().await {
        tracing::warn!("Initial manifest build failed: {}", e);
    }

    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
