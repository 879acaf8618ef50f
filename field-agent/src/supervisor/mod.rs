//! Supervised periodic tasks.
//!
//! A [`Supervisor`] drives one [`SupervisedAction`] on a schedule with an
//! explicit state machine:
//!
//! ```text
//! Stopped -> Running -> { Active, Retrying, Paused, Error } -> Running -> Stopped
//! ```
//!
//! Failures are retried with exponential backoff up to an attempt ceiling,
//! after which the task falls back to its regular interval and starts a new
//! retry cycle. Every wait is interruptible by `stop()`, `pause()`,
//! `resume()` and `trigger()`.
//!
//! Observers are called inline from the supervisor task after state and
//! stats have been updated. They must return quickly; anything slow belongs
//! on another task.

pub mod policy;

pub use policy::{Disposition, NextStep, RetryPolicy};

use crate::utils::{AgentError, ErrorClass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Running,
    Paused,
    Active,
    Retrying,
    Error,
}

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ActionError {
    pub reason: String,
    pub disposition: Disposition,
}

impl ActionError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            disposition: Disposition::Retry,
        }
    }

    pub fn no_retry(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            disposition: Disposition::NoRetry,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            disposition: Disposition::Fatal,
        }
    }
}

impl From<AgentError> for ActionError {
    fn from(err: AgentError) -> Self {
        let reason = err.to_string();
        match err.class() {
            ErrorClass::TransientNetwork | ErrorClass::LocalResource | ErrorClass::Integrity => {
                ActionError::retry(reason)
            }
            ErrorClass::PermanentNetwork => ActionError::no_retry(reason),
            ErrorClass::FatalConfig => ActionError::fatal(reason),
        }
    }
}

/// Unit of work run by a supervisor.
#[async_trait]
pub trait SupervisedAction: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Run once. `cancel` fires when the supervisor is stopping; the action
    /// should wind down at its next safe point.
    async fn run(&self, cancel: &CancellationToken) -> Result<Self::Output, ActionError>;
}

/// Callbacks fired by a supervisor. All default to no-ops.
pub trait SupervisorObserver<T>: Send + Sync {
    fn on_started(&self) {}
    fn on_succeeded(&self, _output: &T) {}
    fn on_failed(&self, _reason: &str) {}
    fn on_retry_scheduled(&self, _attempt: u32, _max_attempts: u32, _delay: Duration) {}
    fn on_scheduled(&self, _delay: Duration) {}
    fn on_state_changed(&self, _state: SupervisorState) {}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStats {
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_delay_secs: Option<f64>,
}

impl SupervisorStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_runs as f64
        }
    }
}

struct Shared<A: SupervisedAction> {
    action: A,
    policy: RetryPolicy,
    observers: Vec<Arc<dyn SupervisorObserver<A::Output>>>,
    state: watch::Sender<SupervisorState>,
    stats: RwLock<SupervisorStats>,
    paused: AtomicBool,
    triggered: AtomicBool,
    wake: Notify,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor<A: SupervisedAction> {
    shared: Arc<Shared<A>>,
    worker: Mutex<Option<Worker>>,
    stop_timeout: Duration,
}

impl<A: SupervisedAction> Supervisor<A> {
    pub fn new(action: A, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            shared: Arc::new(Shared {
                action,
                policy,
                observers: Vec::new(),
                state,
                stats: RwLock::new(SupervisorStats::default()),
                paused: AtomicBool::new(false),
                triggered: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            worker: Mutex::new(None),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Register an observer. Only effective before the first `start()`.
    pub fn with_observer(mut self, observer: Arc<dyn SupervisorObserver<A::Output>>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.observers.push(observer),
            None => warn!("Observer added to a supervisor that is already shared; ignored"),
        }
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.shared.action.name()
    }

    pub fn action(&self) -> &A {
        &self.shared.action
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    pub async fn stats(&self) -> SupervisorStats {
        self.shared.stats.read().await.clone()
    }

    /// Start the background loop. A no-op when it is already running; the
    /// only way out of `Error`.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Supervisor '{}' already running", self.name());
                return;
            }
        }

        let cancel = CancellationToken::new();
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.triggered.store(false, Ordering::SeqCst);
        self.shared.set_state(SupervisorState::Running);
        info!("Supervisor '{}' started", self.name());

        let shared = Arc::clone(&self.shared);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { shared.run_loop(loop_cancel).await });

        *worker = Some(Worker { cancel, handle });
    }

    /// Stop the loop and wait (bounded) for it to exit. Safe from any state.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();

        if let Some(Worker { cancel, mut handle }) = worker {
            cancel.cancel();
            match tokio::time::timeout(self.stop_timeout, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Supervisor '{}' did not stop within {:?}, aborting",
                        self.name(),
                        self.stop_timeout
                    );
                    handle.abort();
                }
            }
        }

        self.shared.set_state(SupervisorState::Stopped);
        info!("Supervisor '{}' stopped", self.name());
    }

    /// Suspend scheduling. A run in progress finishes first.
    pub fn pause(&self) {
        if self.shared.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state();
        if matches!(state, SupervisorState::Running | SupervisorState::Retrying) {
            self.shared.set_state(SupervisorState::Paused);
        }
        info!("Supervisor '{}' paused", self.name());
        self.shared.wake.notify_one();
    }

    pub fn resume(&self) {
        if !self.shared.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.state() == SupervisorState::Paused {
            self.shared.set_state(SupervisorState::Running);
        }
        info!("Supervisor '{}' resumed", self.name());
        self.shared.wake.notify_one();
    }

    /// Run as soon as possible instead of waiting for the scheduled time.
    pub fn trigger(&self) {
        self.shared.triggered.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

/// Type-erased control surface, so callers can hold supervisors of
/// different actions side by side.
#[async_trait]
pub trait SupervisorHandle: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> SupervisorState;
    async fn stats(&self) -> SupervisorStats;
    async fn start(&self);
    async fn stop(&self);
    fn pause(&self);
    fn resume(&self);
    fn trigger(&self);
}

#[async_trait]
impl<A: SupervisedAction> SupervisorHandle for Supervisor<A> {
    fn name(&self) -> &str {
        Supervisor::name(self)
    }

    fn state(&self) -> SupervisorState {
        Supervisor::state(self)
    }

    async fn stats(&self) -> SupervisorStats {
        Supervisor::stats(self).await
    }

    async fn start(&self) {
        Supervisor::start(self).await
    }

    async fn stop(&self) {
        Supervisor::stop(self).await
    }

    fn pause(&self) {
        Supervisor::pause(self)
    }

    fn resume(&self) {
        Supervisor::resume(self)
    }

    fn trigger(&self) {
        Supervisor::trigger(self)
    }
}

impl<A: SupervisedAction> Shared<A> {
    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Supervisor '{}': {:?} -> {:?}", self.action.name(), previous, state);
            for observer in &self.observers {
                observer.on_state_changed(state);
            }
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut delay = self.policy.initial_delay;
        let mut failures_in_cycle = 0u32;

        loop {
            {
                let mut stats = self.stats.write().await;
                stats.next_delay_secs = Some(delay.as_secs_f64());
            }
            for observer in &self.observers {
                observer.on_scheduled(delay);
            }

            if !self.wait(delay, &cancel).await {
                break;
            }

            self.set_state(SupervisorState::Active);
            {
                let mut stats = self.stats.write().await;
                stats.total_runs += 1;
                stats.last_run_at = Some(Utc::now());
                stats.next_delay_secs = None;
            }
            for observer in &self.observers {
                observer.on_started();
            }

            match self.action.run(&cancel).await {
                Ok(output) => {
                    failures_in_cycle = 0;
                    {
                        let mut stats = self.stats.write().await;
                        stats.successes += 1;
                        stats.consecutive_failures = 0;
                        stats.last_success_at = Some(Utc::now());
                    }
                    self.set_state(SupervisorState::Running);
                    for observer in &self.observers {
                        observer.on_succeeded(&output);
                    }
                    delay = self.policy.interval;
                }
                Err(e) => {
                    failures_in_cycle += 1;
                    {
                        let mut stats = self.stats.write().await;
                        stats.failures += 1;
                        stats.consecutive_failures += 1;
                        stats.last_error = Some(e.reason.clone());
                    }

                    match self.policy.next_step(failures_in_cycle, e.disposition) {
                        NextStep::Retry { attempt, delay: backoff } => {
                            warn!(
                                "'{}' failed (attempt {}/{}), retrying in {:?}: {}",
                                self.action.name(),
                                attempt,
                                self.policy.max_attempts,
                                backoff,
                                e
                            );
                            self.set_state(SupervisorState::Retrying);
                            for observer in &self.observers {
                                observer.on_failed(&e.reason);
                                observer.on_retry_scheduled(attempt, self.policy.max_attempts, backoff);
                            }
                            delay = backoff;
                        }
                        NextStep::Scheduled(interval) => {
                            warn!(
                                "'{}' failed, next run at the regular interval ({:?}): {}",
                                self.action.name(),
                                interval,
                                e
                            );
                            failures_in_cycle = 0;
                            self.set_state(SupervisorState::Running);
                            for observer in &self.observers {
                                observer.on_failed(&e.reason);
                            }
                            delay = interval;
                        }
                        NextStep::Halt => {
                            tracing::error!("'{}' hit an unrecoverable error: {}", self.action.name(), e);
                            self.set_state(SupervisorState::Error);
                            for observer in &self.observers {
                                observer.on_failed(&e.reason);
                            }
                            return;
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        self.set_state(SupervisorState::Stopped);
    }

    /// Sleep until `delay` has passed, a trigger arrives, or cancellation.
    /// Pausing suspends the wait. Returns false when cancelled.
    async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            if cancel.is_cancelled() {
                return false;
            }

            if self.paused.load(Ordering::SeqCst) {
                self.set_state(SupervisorState::Paused);
                tokio::select! {
                    _ = self.wake.notified() => continue,
                    _ = cancel.cancelled() => return false,
                }
            }

            if self.triggered.swap(false, Ordering::SeqCst) {
                return true;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if !self.paused.load(Ordering::SeqCst) {
                        return true;
                    }
                }
                _ = self.wake.notified() => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
}
