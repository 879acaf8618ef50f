//! Supervisor observers that log transitions and publish them as events.

use super::{AgentEvent, EventBus};
use crate::mount::{MountEvents, MountReport};
use crate::supervisor::{SupervisorObserver, SupervisorState};
use crate::transfer::SyncResult;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Running totals across every successful sync since start-up.
#[derive(Debug, Default)]
pub struct SyncTotals {
    files_transferred: AtomicU64,
    bytes_transferred: AtomicU64,
    files_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTotalsSnapshot {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub files_deleted: u64,
}

impl SyncTotals {
    pub fn record(&self, result: &SyncResult) {
        self.files_transferred
            .fetch_add(result.files_transferred as u64, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(result.bytes_transferred, Ordering::Relaxed);
        self.files_deleted
            .fetch_add(result.files_deleted as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncTotalsSnapshot {
        SyncTotalsSnapshot {
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
        }
    }
}

pub struct SyncNotifier {
    bus: EventBus,
    totals: Arc<SyncTotals>,
}

impl SyncNotifier {
    pub fn new(bus: EventBus, totals: Arc<SyncTotals>) -> Self {
        Self { bus, totals }
    }
}

impl SupervisorObserver<SyncResult> for SyncNotifier {
    fn on_started(&self) {
        info!("Sync started");
        self.bus.publish(AgentEvent::SyncStarted);
    }

    fn on_succeeded(&self, result: &SyncResult) {
        info!(
            "Sync completed: {} file(s), {} bytes, {} deleted in {:.1}s",
            result.files_transferred,
            result.bytes_transferred,
            result.files_deleted,
            result.duration_secs
        );
        self.totals.record(result);
        self.bus.publish(AgentEvent::SyncCompleted(result.clone()));
    }

    fn on_failed(&self, reason: &str) {
        error!("Sync failed: {}", reason);
        self.bus.publish(AgentEvent::SyncFailed {
            reason: reason.to_string(),
        });
    }

    fn on_retry_scheduled(&self, attempt: u32, max_attempts: u32, delay: Duration) {
        warn!(
            "Sync retry {}/{} scheduled in {}s",
            attempt,
            max_attempts,
            delay.as_secs()
        );
        self.bus.publish(AgentEvent::RetryScheduled {
            task: "sync".to_string(),
            attempt,
            max_attempts,
            delay_secs: delay.as_secs_f64(),
        });
    }

    fn on_state_changed(&self, state: SupervisorState) {
        self.bus.publish(AgentEvent::StateChanged {
            task: "sync".to_string(),
            state,
        });
    }
}

pub struct MountNotifier {
    bus: EventBus,
}

impl MountNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl SupervisorObserver<MountReport> for MountNotifier {
    fn on_succeeded(&self, report: &MountReport) {
        if report.remounted || report.low_space {
            self.bus.publish(AgentEvent::MountChecked(report.clone()));
        }
    }

    fn on_failed(&self, reason: &str) {
        error!("Mount check failed: {}", reason);
    }

    fn on_retry_scheduled(&self, attempt: u32, max_attempts: u32, delay: Duration) {
        warn!(
            "Remount retry {}/{} scheduled in {}s",
            attempt,
            max_attempts,
            delay.as_secs()
        );
        self.bus.publish(AgentEvent::RetryScheduled {
            task: "mount".to_string(),
            attempt,
            max_attempts,
            delay_secs: delay.as_secs_f64(),
        });
    }

    fn on_state_changed(&self, state: SupervisorState) {
        self.bus.publish(AgentEvent::StateChanged {
            task: "mount".to_string(),
            state,
        });
    }
}

impl MountEvents for MountNotifier {
    fn on_mount_lost(&self) {
        warn!("Virtual volume lost");
        self.bus.publish(AgentEvent::MountLost);
    }

    fn on_mount_recovered(&self) {
        info!("Virtual volume recovered");
        self.bus.publish(AgentEvent::MountRecovered);
    }
}
