//! Retry and escalation policy of a supervised task.

use crate::resilience::Backoff;
use std::time::Duration;

/// How a failed run should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and retry, up to the attempt ceiling.
    Retry,
    /// Retrying cannot help soon: wait for the regular interval.
    NoRetry,
    /// Stop scheduling and enter the error state.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextStep {
    /// Retry after `delay`; `attempt` counts failures in the current cycle.
    Retry { attempt: u32, delay: Duration },
    /// Fall back to the regular schedule and reset the retry cycle.
    Scheduled(Duration),
    Halt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub initial_delay: Duration,
    /// Consecutive failures after which the task returns to `interval`.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Decide what follows the `failures`-th consecutive failure (1-based)
    /// of the current retry cycle.
    pub fn next_step(&self, failures: u32, disposition: Disposition) -> NextStep {
        match disposition {
            Disposition::Fatal => NextStep::Halt,
            Disposition::NoRetry => NextStep::Scheduled(self.interval),
            Disposition::Retry if failures < self.max_attempts => NextStep::Retry {
                attempt: failures,
                delay: self.backoff.delay(failures.saturating_sub(1)),
            },
            Disposition::Retry => NextStep::Scheduled(self.interval),
        }
    }
}
