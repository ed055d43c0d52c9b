//! Rtsched: an in-process soft real-time task scheduler.
//!
//! # Overview
//!
//! Rtsched multiplexes user-supplied work functions onto a pool of OS
//! threads under a real-time ordering policy (Earliest Deadline First, Rate
//! Monotonic, or static priority), enforces per-task deadlines, coordinates
//! shared resources through a priority-inheriting mutex, and provides
//! inter-task messaging, dynamic priority adjustment, soft time-based
//! preemption, and a deadlock watchdog.
//!
//! Execution is best-effort soft real-time, bounded by the host OS
//! scheduler: preemption is cooperative (a timer nudges running tasks via
//! [`should_yield`]), and a work function always runs to completion once
//! dispatched.
//!
//! # Core behaviors
//!
//! - **Policy-ordered dispatch**: ready tasks are extracted by deadline
//!   (EDF), period (RMS), or effective priority; ordering keys are derived
//!   at extraction, so priority inheritance and deadline updates take
//!   effect without queue rebuilds.
//! - **Priority inheritance**: a mutex holder is raised to its highest
//!   waiter's effective priority and restored on release; release hands the
//!   mutex to the highest-effective-priority waiter, FIFO on ties.
//! - **Deadline enforcement**: overruns are counted and handled per policy
//!   (warn, skip one period, or terminate the task).
//! - **Deadlock detection**: a watchdog scans the wait-for graph and aborts
//!   the lowest-priority acquire in any cycle.
//! - **Signal bridge**: a host-OS signal can trigger an event-driven task
//!   through an async-signal-safe wake pipe.
//!
//! # Module structure
//!
//! - [`clock`]: monotonic time base (seconds as `f64`)
//! - [`task`]: task configuration and lifecycle
//! - [`mutex`]: priority-inheriting mutex
//! - [`inbox`]: per-task FIFO messaging
//! - [`scheduler`]: registry, worker dispatch, release timer, watchdog
//! - [`metrics`]: per-task execution counters
//! - [`config`]: policies and tunables
//! - [`ctx`]: current-task surface for work functions
//! - [`error`]: error types
//!
//! # Example
//!
//! ```no_run
//! use rtsched::{SchedPolicy, Scheduler, Task};
//! use std::time::Duration;
//!
//! let sched = Scheduler::new(SchedPolicy::Edf);
//! sched.add_task(
//!     Task::new("poll-sensors", || { /* ... */ })
//!         .period(Duration::from_millis(100))
//!         .deadline(Duration::from_millis(50))
//!         .priority(3),
//! )?;
//! sched.add_task(Task::new("on-alarm", || { /* ... */ }).event_driven())?;
//! sched.start()?;
//! sched.trigger_task("on-alarm")?;
//! # Ok::<(), rtsched::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod clock;
pub mod config;
pub mod ctx;
pub mod error;
pub mod inbox;
pub mod metrics;
pub mod mutex;
mod ready_queue;
pub mod scheduler;
mod signal_bridge;
pub mod task;
pub mod test_util;

// Re-exports for convenient access to core types
pub use clock::Clock;
pub use config::{OverrunPolicy, SchedPolicy, SchedulerConfig};
pub use ctx::{current_task, should_yield, sleep};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use inbox::{Inbox, Message};
pub use metrics::TaskStats;
pub use mutex::{MutexId, RtMutex};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{Task, TaskId, TaskState, WorkFn};
