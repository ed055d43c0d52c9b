//! Scheduler configuration types.
//!
//! These types hold the concrete values that drive scheduler behavior. In
//! most cases you should use [`Scheduler::builder`](crate::Scheduler::builder)
//! rather than constructing a [`SchedulerConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `scheduling_policy` | `PRIORITY` |
//! | `parallelism` | available CPU parallelism |
//! | `preempt_quantum` | 10 ms |
//! | `watchdog_period` | 1 s |
//! | `overrun_policy` | `warn` |
//! | `inbox_capacity` | 0 (unbounded) |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ready-queue ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchedPolicy {
    /// Earliest Deadline First: tasks with the nearest absolute deadline run
    /// first. Tasks without a deadline sort last.
    Edf,
    /// Rate Monotonic: shorter-period tasks run first. Aperiodic tasks
    /// (period zero) sort last.
    Rms,
    /// Static priority: higher effective priority runs first.
    Priority,
}

impl Default for SchedPolicy {
    fn default() -> Self {
        Self::Priority
    }
}

impl std::fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edf => write!(f, "EDF"),
            Self::Rms => write!(f, "RMS"),
            Self::Priority => write!(f, "PRIORITY"),
        }
    }
}

/// What the dispatcher does when a run exceeds its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Count the overrun and log a warning; the task keeps its cadence.
    Warn,
    /// Count the overrun and drop the task's next period.
    SkipNext,
    /// Count the overrun and terminate the task.
    Terminate,
}

impl Default for OverrunPolicy {
    fn default() -> Self {
        Self::Warn
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ready-queue ordering policy.
    pub scheduling_policy: SchedPolicy,
    /// Number of worker threads (0 = available parallelism).
    pub parallelism: usize,
    /// Period of the soft-preemption tick.
    pub preempt_quantum: Duration,
    /// Period of the deadlock watchdog scan.
    pub watchdog_period: Duration,
    /// Default overrun handling; tasks may override per-task.
    pub overrun_policy: OverrunPolicy,
    /// Per-task inbox capacity (0 = unbounded).
    pub inbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_policy: SchedPolicy::default(),
            parallelism: 0,
            preempt_quantum: Duration::from_millis(10),
            watchdog_period: Duration::from_secs(1),
            overrun_policy: OverrunPolicy::default(),
            inbox_capacity: 0,
        }
    }
}

impl SchedulerConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.parallelism == 0 {
            self.parallelism = std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1);
        }
        if self.preempt_quantum.is_zero() {
            self.preempt_quantum = Duration::from_millis(10);
        }
        if self.watchdog_period.is_zero() {
            self.watchdog_period = Duration::from_secs(1);
        }
    }
}
