use super::{MountBackend, MountEvents, MountReport};
use crate::supervisor::{ActionError, SupervisedAction};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supervised action: make sure the volume is mounted, remount if not.
pub struct MountWatch<B: MountBackend> {
    backend: B,
    low_space_threshold: u64,
    events: Vec<Arc<dyn MountEvents>>,
    outage: AtomicBool,
}

impl<B: MountBackend> MountWatch<B> {
    pub fn new(backend: B, low_space_threshold: u64) -> Self {
        Self {
            backend,
            low_space_threshold,
            events: Vec::new(),
            outage: AtomicBool::new(false),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn MountEvents>) -> Self {
        self.events.push(events);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn healthy_report(&self, remounted: bool) -> MountReport {
        if self.outage.swap(false, Ordering::SeqCst) {
            info!("Volume {} recovered", self.backend.describe());
            for events in &self.events {
                events.on_mount_recovered();
            }
        }

        let free_bytes = self.backend.free_space().await;
        let low_space = free_bytes.is_some_and(|free| free < self.low_space_threshold);
        if let (true, Some(free)) = (low_space, free_bytes) {
            warn!(
                "Low free space on {}: {:.2} GiB",
                self.backend.describe(),
                free as f64 / (1024.0 * 1024.0 * 1024.0)
            );
        }

        MountReport {
            remounted,
            free_bytes,
            low_space,
        }
    }

    /// Best-effort cleanup of a stale mount point after a failed attempt.
    async fn force_unmount(&self) {
        if let Err(e) = self.backend.unmount(true).await {
            debug!("Force unmount of {} failed: {}", self.backend.describe(), e);
        }
    }
}

#[async_trait]
impl<B: MountBackend> SupervisedAction for MountWatch<B> {
    type Output = MountReport;

    fn name(&self) -> &str {
        "mount"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<MountReport, ActionError> {
        if self.backend.is_mounted().await {
            return Ok(self.healthy_report(false).await);
        }

        if !self.outage.swap(true, Ordering::SeqCst) {
            warn!("Volume {} is not mounted", self.backend.describe());
            for events in &self.events {
                events.on_mount_lost();
            }
        }

        info!("Remounting {}", self.backend.describe());
        if let Err(e) = self.backend.mount().await {
            self.force_unmount().await;
            return Err(e.into());
        }

        if !self.backend.is_mounted().await {
            self.force_unmount().await;
            return Err(ActionError::retry(format!(
                "mount of {} reported success but the volume is not attached",
                self.backend.describe()
            )));
        }

        Ok(self.healthy_report(true).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Backoff;
    use crate::supervisor::{RetryPolicy, Supervisor, SupervisorState};
    use crate::utils::{AgentError, Result};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBackend {
        mounted: AtomicBool,
        mount_calls: AtomicU32,
        unmount_calls: AtomicU32,
        failing_mounts: AtomicU32,
        free: Option<u64>,
    }

    #[async_trait]
    impl MountBackend for FakeBackend {
        fn describe(&self) -> String {
            "fake".to_string()
        }

        async fn is_mounted(&self) -> bool {
            self.mounted.load(Ordering::SeqCst)
        }

        async fn mount(&self) -> Result<()> {
            self.mount_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_mounts.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_mounts.store(failing - 1, Ordering::SeqCst);
                return Err(AgentError::Mount("device busy".to_string()));
            }
            self.mounted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unmount(&self, _force: bool) -> Result<()> {
            self.unmount_calls.fetch_add(1, Ordering::SeqCst);
            self.mounted.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn free_space(&self) -> Option<u64> {
            self.free
        }
    }

    #[derive(Default)]
    struct CountingEvents {
        lost: AtomicU32,
        recovered: AtomicU32,
    }

    impl MountEvents for CountingEvents {
        fn on_mount_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
        fn on_mount_recovered(&self) {
            self.recovered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(5),
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(300)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmounted_volume_is_remounted_once() {
        let watch = MountWatch::new(FakeBackend::default(), 1024);
        let supervisor = Supervisor::new(watch, policy());

        supervisor.start().await;
        for _ in 0..600 {
            let stats = supervisor.stats().await;
            if stats.successes + stats.failures >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let backend = supervisor.action().backend();
        assert_eq!(backend.mount_calls.load(Ordering::SeqCst), 1);
        assert!(backend.mounted.load(Ordering::SeqCst));

        let stats = supervisor.stats().await;
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.successes, 1);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mount_retries_then_recovers() {
        let backend = FakeBackend::default();
        backend.failing_mounts.store(1, Ordering::SeqCst);
        let events = Arc::new(CountingEvents::default());
        let watch = MountWatch::new(backend, 1024).with_events(events.clone());
        let supervisor = Supervisor::new(watch, policy());
        let mut state = supervisor.subscribe_state();

        supervisor.start().await;
        state.wait_for(|s| *s == SupervisorState::Retrying).await.unwrap();
        assert_eq!(supervisor.stats().await.consecutive_failures, 1);
        // Stale mount point cleaned up after the failure
        assert_eq!(supervisor.action().backend().unmount_calls.load(Ordering::SeqCst), 1);

        state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();
        let stats = supervisor.stats().await;
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(supervisor.action().backend().mount_calls.load(Ordering::SeqCst), 2);

        assert_eq!(events.lost.load(Ordering::SeqCst), 1);
        assert_eq!(events.recovered.load(Ordering::SeqCst), 1);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_mounted_volume_reports_low_space() {
        let backend = FakeBackend {
            free: Some(10),
            ..FakeBackend::default()
        };
        backend.mounted.store(true, Ordering::SeqCst);
        let watch = MountWatch::new(backend, 1024);

        let report = watch.run(&CancellationToken::new()).await.unwrap();
        assert!(!report.remounted);
        assert!(report.low_space);
        assert_eq!(watch.backend().mount_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_fires_once_per_outage() {
        let backend = FakeBackend::default();
        backend.failing_mounts.store(3, Ordering::SeqCst);
        let events = Arc::new(CountingEvents::default());
        let watch = MountWatch::new(backend, 0).with_events(events.clone());
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            assert!(watch.run(&cancel).await.is_err());
        }
        assert_eq!(events.lost.load(Ordering::SeqCst), 1);

        assert!(watch.run(&cancel).await.is_ok());
        assert_eq!(events.recovered.load(Ordering::SeqCst), 1);

        // A second outage is reported again
        watch.backend().mounted.store(false, Ordering::SeqCst);
        assert!(watch.run(&cancel).await.is_ok());
        assert_eq!(events.lost.load(Ordering::SeqCst), 2);
        assert_eq!(events.recovered.load(Ordering::SeqCst), 2);
    }
}
