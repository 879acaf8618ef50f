//! Network resilience for one peer: pooled connections with health tracking,
//! error classification, backoff, and an offline operation queue.
//!
//! A [`ResilienceLayer`] is scoped to a single peer and owned by whoever wires
//! up the supervised tasks. Operations submitted while the link is down are
//! queued and replayed by the monitor task once connectivity returns.

pub mod backoff;
pub mod error;
pub mod pool;
pub mod probe;
pub mod queue;

pub use backoff::Backoff;
pub use error::{NetworkError, NetworkErrorKind};
pub use pool::{ConnectionPool, Endpoint, PoolHealth};
pub use probe::ConnectivityProbe;
pub use queue::{OperationFn, OperationQueue, Priority, QueuedOperation};

use crate::utils::{AgentError, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queued operations replayed per monitor tick.
pub const DRAIN_PER_TICK: usize = 10;

#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    pub probe_interval: Duration,
    pub queue_expiry: Duration,
    pub operation_max_retries: u32,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            queue_expiry: queue::DEFAULT_QUEUE_EXPIRY,
            operation_max_retries: queue::DEFAULT_OPERATION_RETRIES,
        }
    }
}

/// Result of submitting a network action.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// Offline: the action was stored and will be replayed later.
    Queued(Uuid),
    Failed(NetworkError),
}

pub struct ResilienceLayer {
    pool: ConnectionPool,
    probe: ConnectivityProbe,
    queue: OperationQueue,
    settings: ResilienceSettings,
}

impl ResilienceLayer {
    pub fn new(
        pool: ConnectionPool,
        probe: ConnectivityProbe,
        queue: OperationQueue,
        settings: ResilienceSettings,
    ) -> Self {
        Self {
            pool,
            probe,
            queue,
            settings,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn probe(&self) -> &ConnectivityProbe {
        &self.probe
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        self.probe.is_online()
    }

    /// Fail fast unless both the link and the peer answer.
    pub async fn ensure_reachable(&self) -> Result<()> {
        if !self.probe.is_online() && !self.probe.check().await {
            return Err(AgentError::Offline);
        }
        self.pool.check_health().await?;
        Ok(())
    }

    /// Run `op` now when online; otherwise queue it for replay.
    ///
    /// The queued copy discards the output, so only the side effects of a
    /// replayed operation are observable.
    pub async fn submit<T, F>(&self, priority: Priority, op: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: Fn() -> BoxFuture<'static, std::result::Result<T, NetworkError>> + Send + Sync + 'static,
    {
        if self.probe.is_online() {
            return match op().await {
                Ok(value) => Outcome::Success(value),
                Err(e) => Outcome::Failed(e),
            };
        }

        let payload: OperationFn = Arc::new(move || op().map(|r| r.map(|_| ())).boxed());
        let operation = QueuedOperation::new(priority, self.settings.operation_max_retries, payload);
        let id = operation.id;

        if self.queue.enqueue(operation).await {
            info!("Offline, queued operation {} ({:?} priority)", id, priority);
            Outcome::Queued(id)
        } else {
            Outcome::Failed(NetworkError::new(
                NetworkErrorKind::Unknown,
                "offline and the operation queue is full",
            ))
        }
    }

    /// Replay up to `max` queued operations. Retryable failures go back into
    /// the queue until their retry budget is spent.
    pub async fn drain(&self, max: usize) -> usize {
        let mut replayed = 0;
        let mut requeue = Vec::new();

        while replayed < max {
            let Some(mut op) = self.queue.dequeue().await else {
                break;
            };
            replayed += 1;

            match (op.payload)().await {
                Ok(()) => debug!("Queued operation {} completed", op.id),
                Err(e) if e.is_retryable() && op.retry_count < op.max_retries => {
                    op.retry_count += 1;
                    op.last_error = Some(e.to_string());
                    debug!(
                        "Queued operation {} failed (attempt {}/{}): {}",
                        op.id, op.retry_count, op.max_retries, e
                    );
                    requeue.push(op);
                }
                Err(e) => {
                    warn!(
                        "Dropping queued operation {} after {} retries: {}",
                        op.id, op.retry_count, e
                    );
                }
            }
        }

        for op in requeue {
            self.queue.enqueue(op).await;
        }

        replayed
    }

    /// One monitor pass: probe, drain when online, sweep, and re-probe an
    /// unhealthy pool.
    pub async fn run_maintenance(&self) {
        let online = self.probe.check().await;

        if online {
            let replayed = self.drain(DRAIN_PER_TICK).await;
            if replayed > 0 {
                info!("Replayed {} queued operations", replayed);
            }

            if !self.pool.is_healthy().await {
                if let Err(e) = self.pool.check_health().await {
                    debug!("Peer still unhealthy: {}", e);
                }
            }
        }

        self.queue.sweep_expired(self.settings.queue_expiry).await;
    }

    /// Background maintenance loop, ticking at the probe interval.
    pub fn spawn_monitor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_maintenance().await;
                    }
                    _ = cancel.cancelled() => {
                        info!("Resilience monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
