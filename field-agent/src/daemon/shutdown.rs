//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the coordinator's token. Supervisors then stop at their
//! next boundary: batches in flight finish, the rest are skipped.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled once shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown without waiting for a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, or for a programmatic trigger
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
