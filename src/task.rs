//! The unit of scheduling.
//!
//! [`Task`] is the builder-produced static configuration handed to
//! [`Scheduler::add_task`](crate::Scheduler::add_task). On registration it
//! becomes a [`TaskCell`]: static config plus a per-task lock over the
//! dynamic state (lifecycle, priorities, release/deadline points,
//! inheritance ceilings, stats), the message inbox, and the park/grant
//! rendezvous used by contended mutex acquires.

use crate::config::OverrunPolicy;
use crate::inbox::{Inbox, Message};
use crate::metrics::TaskStats;
use crate::mutex::MutexId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Scheduler-assigned task identifier.
///
/// All cross-references (mutex owners, waiter sets, queue entries) are ids
/// into the scheduler's registry rather than pointer cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Builds an id from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Constructed but not yet registered.
    Created,
    /// Eligible to run; present in the ready queue.
    Ready,
    /// Executing on a worker thread.
    Running,
    /// Event-driven task awaiting a trigger.
    WaitingEvent,
    /// Blocked in a contended mutex acquire.
    WaitingMutex,
    /// Periodic task waiting for its next release.
    Sleeping,
    /// Removed, completed (one-shot), or killed by overrun policy.
    Terminated,
}

impl TaskState {
    /// Returns true for states a task never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// The work capability: a nullary callable, run on worker threads.
///
/// Panics inside the work function are caught by the dispatcher, counted in
/// the task's `errors` stat, and do not kill the worker.
pub type WorkFn = Box<dyn Fn() + Send + Sync + 'static>;

/// Static task configuration, built with chained setters.
///
/// ```
/// use rtsched::Task;
/// use std::time::Duration;
///
/// let task = Task::new("tick", || println!("tick"))
///     .period(Duration::from_millis(100))
///     .priority(3)
///     .deadline(Duration::from_millis(50));
/// assert_eq!(task.name(), "tick");
/// ```
pub struct Task {
    pub(crate) name: String,
    pub(crate) work: WorkFn,
    pub(crate) period: Duration,
    pub(crate) base_priority: i32,
    pub(crate) deadline: Duration,
    pub(crate) event_driven: bool,
    pub(crate) max_runs: Option<u64>,
    pub(crate) overrun_override: Option<OverrunPolicy>,
}

impl Task {
    /// Creates a one-shot task with priority 0 and no deadline.
    pub fn new(name: impl Into<String>, work: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            work: Box::new(work),
            period: Duration::ZERO,
            base_priority: 0,
            deadline: Duration::ZERO,
            event_driven: false,
            max_runs: None,
            overrun_override: None,
        }
    }

    /// Release period. Zero (the default) means one-shot.
    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Base priority; larger is more urgent.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.base_priority = priority;
        self
    }

    /// Relative deadline per release. Zero (the default) means unbounded.
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Marks the task event-driven: it runs only on `trigger_task`.
    #[must_use]
    pub fn event_driven(mut self) -> Self {
        self.event_driven = true;
        self
    }

    /// Terminates the task after `n` completed runs.
    #[must_use]
    pub fn max_runs(mut self, n: u64) -> Self {
        self.max_runs = Some(n);
        self
    }

    /// Overrides the scheduler-wide overrun policy for this task.
    #[must_use]
    pub fn on_overrun(mut self, policy: OverrunPolicy) -> Self {
        self.overrun_override = Some(policy);
        self
    }

    /// The task's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("base_priority", &self.base_priority)
            .field("deadline", &self.deadline)
            .field("event_driven", &self.event_driven)
            .field("max_runs", &self.max_runs)
            .finish_non_exhaustive()
    }
}

/// Dynamic task state, guarded by the cell's per-task lock.
#[derive(Debug)]
pub(crate) struct TaskDyn {
    pub state: TaskState,
    pub base_priority: i32,
    /// Always >= `base_priority`; raised by mutex inheritance.
    pub effective_priority: i32,
    /// Absolute release time (seconds) of the current or next period.
    pub next_release: f64,
    /// Absolute deadline (seconds); `INFINITY` when unbounded.
    pub next_deadline_abs: f64,
    /// Coalesced pending trigger for event-driven tasks.
    pub pending_trigger: bool,
    /// One period will be dropped (overrun policy `skip_next`).
    pub skip_next: bool,
    /// Per held mutex, the current waiter ceiling inherited through it.
    pub inherited: Vec<(MutexId, i32)>,
    /// Mutexes currently held, acquisition order.
    pub held: Vec<MutexId>,
    /// The single mutex this task is blocked on, if any.
    pub waiting_on: Option<MutexId>,
    /// Set by the watchdog to abort a cyclic acquire.
    pub abort_acquire: bool,
    pub stats: TaskStats,
}

impl TaskDyn {
    /// Re-derives effective priority as `max(base, live ceilings)`.
    pub fn rederive_priority(&mut self) {
        let floor = self.inherited.iter().map(|(_, p)| *p).max();
        self.effective_priority = match floor {
            Some(ceiling) => self.base_priority.max(ceiling),
            None => self.base_priority,
        };
    }

    /// Records or clears the inheritance ceiling contributed by `mutex`.
    pub fn set_ceiling(&mut self, mutex: MutexId, ceiling: Option<i32>) {
        self.inherited.retain(|(m, _)| *m != mutex);
        if let Some(p) = ceiling {
            self.inherited.push((mutex, p));
        }
        self.rederive_priority();
    }
}

/// A registered task: static config plus locked dynamic state.
pub(crate) struct TaskCell {
    pub id: TaskId,
    pub name: String,
    pub work: WorkFn,
    pub period: Duration,
    pub deadline: Duration,
    pub event_driven: bool,
    pub max_runs: Option<u64>,
    pub overrun_override: Option<OverrunPolicy>,
    pub inbox: Inbox<Message>,
    /// Wakes this task's thread out of a contended acquire.
    pub grant: Parker,
    /// Cooperative stop flag, observed at dispatch boundaries.
    pub terminate: AtomicBool,
    /// Soft-preemption hint, readable via `ctx::should_yield`.
    pub yield_hint: AtomicBool,
    inner: Mutex<TaskDyn>,
}

impl TaskCell {
    pub fn new(id: TaskId, task: Task, inbox_capacity: usize) -> Self {
        let base = task.base_priority;
        Self {
            id,
            name: task.name,
            work: task.work,
            period: task.period,
            deadline: task.deadline,
            event_driven: task.event_driven,
            max_runs: task.max_runs,
            overrun_override: task.overrun_override,
            inbox: Inbox::new(inbox_capacity),
            grant: Parker::new(),
            terminate: AtomicBool::new(false),
            yield_hint: AtomicBool::new(false),
            inner: Mutex::new(TaskDyn {
                state: TaskState::Created,
                base_priority: base,
                effective_priority: base,
                next_release: 0.0,
                next_deadline_abs: f64::INFINITY,
                pending_trigger: false,
                skip_next: false,
                inherited: Vec::new(),
                held: Vec::new(),
                waiting_on: None,
                abort_acquire: false,
                stats: TaskStats::default(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TaskDyn> {
        self.inner.lock().expect("task lock poisoned")
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Flips the cooperative stop flag and wakes every wait the task could
    /// be parked in.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.inbox.close();
        self.grant.unpark();
    }
}

impl fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("period", &self.period)
            .field("event_driven", &self.event_driven)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// A mechanism for parking and unparking one thread.
#[derive(Debug)]
pub(crate) struct Parker {
    lock: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Parks the current thread up to `duration`, consuming a pending token.
    pub fn park_timeout(&self, duration: Duration) {
        let mut notified = self.lock.lock().expect("parker lock poisoned");
        if !*notified {
            let (guard, _timed_out) = self
                .cvar
                .wait_timeout(notified, duration)
                .expect("parker lock poisoned");
            notified = guard;
        }
        *notified = false;
    }

    /// Unparks a parked thread (or stores a token for the next park).
    pub fn unpark(&self) {
        {
            let mut notified = self.lock.lock().expect("parker lock poisoned");
            *notified = true;
        }
        self.cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn builder_defaults() {
        let task = Task::new("t", || {});
        assert_eq!(task.name(), "t");
        assert_eq!(task.period, Duration::ZERO);
        assert_eq!(task.base_priority, 0);
        assert_eq!(task.deadline, Duration::ZERO);
        assert!(!task.event_driven);
        assert!(task.max_runs.is_none());
        assert!(task.overrun_override.is_none());
    }

    #[test]
    fn builder_setters_chain() {
        let task = Task::new("t", || {})
            .period(Duration::from_millis(100))
            .priority(7)
            .deadline(Duration::from_millis(40))
            .event_driven()
            .max_runs(3)
            .on_overrun(OverrunPolicy::Terminate);
        assert_eq!(task.period, Duration::from_millis(100));
        assert_eq!(task.base_priority, 7);
        assert_eq!(task.deadline, Duration::from_millis(40));
        assert!(task.event_driven);
        assert_eq!(task.max_runs, Some(3));
        assert_eq!(task.overrun_override, Some(OverrunPolicy::Terminate));
    }

    #[test]
    fn cell_starts_created_with_base_priority() {
        let cell = TaskCell::new(TaskId::from_raw(1), Task::new("t", || {}).priority(4), 0);
        let inner = cell.lock();
        assert_eq!(inner.state, TaskState::Created);
        assert_eq!(inner.base_priority, 4);
        assert_eq!(inner.effective_priority, 4);
        assert!(inner.next_deadline_abs.is_infinite());
    }

    #[test]
    fn rederive_tracks_ceilings() {
        let cell = TaskCell::new(TaskId::from_raw(1), Task::new("t", || {}).priority(2), 0);
        let mut inner = cell.lock();

        inner.set_ceiling(MutexId::from_raw(10), Some(5));
        assert_eq!(inner.effective_priority, 5);

        // A second mutex with a higher ceiling dominates.
        inner.set_ceiling(MutexId::from_raw(11), Some(8));
        assert_eq!(inner.effective_priority, 8);

        // Dropping the higher ceiling falls back to the lower one.
        inner.set_ceiling(MutexId::from_raw(11), None);
        assert_eq!(inner.effective_priority, 5);

        // Dropping the last ceiling restores base.
        inner.set_ceiling(MutexId::from_raw(10), None);
        assert_eq!(inner.effective_priority, 2);
    }

    #[test]
    fn effective_never_below_base() {
        let cell = TaskCell::new(TaskId::from_raw(1), Task::new("t", || {}).priority(9), 0);
        let mut inner = cell.lock();
        inner.set_ceiling(MutexId::from_raw(10), Some(3));
        assert_eq!(inner.effective_priority, 9);
    }

    #[test]
    fn request_terminate_closes_inbox() {
        let cell = TaskCell::new(TaskId::from_raw(1), Task::new("t", || {}), 0);
        cell.request_terminate();
        assert!(cell.is_terminated());
        let err = cell.inbox.receive(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Shutdown);
    }

    #[test]
    fn parker_token_prevents_missed_unpark() {
        let parker = Parker::new();
        parker.unpark();
        let start = Instant::now();
        parker.park_timeout(Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn parker_wakes_parked_thread() {
        let parker = Arc::new(Parker::new());
        let p = Arc::clone(&parker);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            p.park_timeout(Duration::from_secs(5));
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(20));
        parker.unpark();
        let waited = handle.join().unwrap();
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn terminal_state_predicate() {
        assert!(TaskState::Terminated.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
        assert!(!TaskState::WaitingMutex.is_terminal());
    }
}
