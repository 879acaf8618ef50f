use super::ShutdownCoordinator;
use crate::api::{self, AppState};
use crate::config::Config;
use crate::resilience::{ConnectionPool, ConnectivityProbe, OperationQueue, ResilienceLayer};
use crate::supervisor::{Supervisor, SupervisorHandle};
use crate::transfer::{SyncEngine, SyncResult};
use crate::utils::Result;
use crate::ws::{EventBus, SyncNotifier, SyncTotals};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Grace period for background tasks after supervisors have stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One resilience layer for the configured peer.
pub fn build_resilience(config: &Config) -> Result<Arc<ResilienceLayer>> {
    let pool = ConnectionPool::new(
        &config.peer.url,
        Duration::from_secs(config.peer.request_timeout_secs),
        config.network.unhealthy_threshold,
    )?;
    let probe = ConnectivityProbe::new(
        config.network.probe_address.clone(),
        Duration::from_secs(config.network.probe_timeout_secs),
    );
    let queue = OperationQueue::new(config.network.queue_capacity);

    Ok(Arc::new(ResilienceLayer::new(
        pool,
        probe,
        queue,
        config.resilience_settings(),
    )))
}

#[cfg(target_os = "linux")]
fn build_mount_supervisor(config: &Config, events: &EventBus) -> Option<Arc<dyn SupervisorHandle>> {
    use crate::mount::{LoopMount, MountWatch};
    use crate::ws::MountNotifier;

    if !config.mount.enabled {
        return None;
    }

    let mut backend = LoopMount::new(
        &config.mount.image,
        &config.mount.mount_point,
        Duration::from_secs(config.mount.remount_timeout_secs),
    )
    .with_options(config.mount.options.clone());
    if let Some(fs_type) = &config.mount.fs_type {
        backend = backend.with_fs_type(fs_type.clone());
    }

    let notifier = Arc::new(MountNotifier::new(events.clone()));
    let watch = MountWatch::new(backend, config.mount.low_space_bytes).with_events(notifier.clone());
    let supervisor = Supervisor::new(watch, config.mount_policy()).with_observer(notifier);
    Some(Arc::new(supervisor))
}

#[cfg(not(target_os = "linux"))]
fn build_mount_supervisor(config: &Config, _events: &EventBus) -> Option<Arc<dyn SupervisorHandle>> {
    if config.mount.enabled {
        warn!("Mount supervision is only supported on Linux; mount.enabled ignored");
    }
    None
}

/// Run the agent until SIGINT/SIGTERM.
pub async fn run(config: Config, port: u16) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let resilience = build_resilience(&config)?;
    let events = EventBus::new();
    let totals = Arc::new(SyncTotals::default());

    let engine = SyncEngine::new(config.sync_settings(), Arc::clone(&resilience));
    let sync: Arc<dyn SupervisorHandle> = Arc::new(
        Supervisor::new(engine, config.sync_policy())
            .with_observer(Arc::new(SyncNotifier::new(events.clone(), Arc::clone(&totals)))),
    );
    let mount = build_mount_supervisor(&config, &events);

    let monitor = Arc::clone(&resilience).spawn_monitor(shutdown.token());

    sync.start().await;
    if let Some(mount) = &mount {
        mount.start().await;
    }

    let state = AppState {
        agent_id: Arc::from(config.agent.id.as_str()),
        started_at: Utc::now(),
        sync: Arc::clone(&sync),
        mount: mount.clone(),
        resilience,
        events,
        totals,
    };
    let app = api::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    info!("Mirroring {} from {}", config.sync.mirror_root.display(), config.peer.url);

    let server_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
    });

    shutdown.wait_for_signal().await;

    sync.stop().await;
    if let Some(mount) = &mount {
        mount.stop().await;
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, monitor).await.is_err() {
        warn!("Resilience monitor did not stop in time");
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task panicked: {}", e),
        Err(_) => warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}

/// Perform a single sync and return its result. Ctrl+C stops it at the
/// next batch boundary.
pub async fn run_once(config: &Config) -> anyhow::Result<SyncResult> {
    let resilience = build_resilience(config)?;
    let engine = SyncEngine::new(config.sync_settings(), resilience);

    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });

    let result = engine.sync(&token).await;
    signals.abort();

    Ok(result?)
}
