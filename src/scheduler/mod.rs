//! The scheduling kernel.
//!
//! [`Scheduler`] owns the task registry, the policy-ordered ready queue,
//! the worker pool, the release timer (which doubles as the soft-preemption
//! tick), the deadlock watchdog, and the signal-to-task bridge.
//!
//! Locking discipline: the scheduler state lock guards the registry, ready
//! queue, sleeper heap and running set, and is held only for short table
//! operations. Each task and each mutex carry their own lock. Lock order is
//! scheduler state → mutex internal → task; user work functions run under
//! none of them.

mod timer;
mod watchdog;
mod worker;

use crate::clock::Clock;
use crate::config::{SchedPolicy, SchedulerConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::inbox::Message;
use crate::metrics::TaskStats;
use crate::mutex::{MutexId, RtMutex};
use crate::ready_queue::{OrderKey, ReadyQueue};
use crate::signal_bridge;
use crate::task::{Parker, Task, TaskCell, TaskId, TaskState};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// A pending periodic release.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sleeper {
    pub wake_at: f64,
    pub task: TaskId,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest wake first.
        other
            .wake_at
            .total_cmp(&self.wake_at)
            .then(other.task.cmp(&self.task))
    }
}

/// Mutable scheduler state, guarded by the state lock.
pub(crate) struct SchedState {
    pub tasks: HashMap<TaskId, Arc<TaskCell>>,
    pub by_name: HashMap<String, TaskId>,
    pub ready: ReadyQueue,
    pub sleepers: BinaryHeap<Sleeper>,
    pub running: HashSet<TaskId>,
    pub mutexes: Vec<Weak<RtMutex>>,
}

/// Shared scheduler core; workers, timer, watchdog and mutexes reference it.
pub(crate) struct Core {
    pub config: SchedulerConfig,
    pub clock: Clock,
    state: Mutex<SchedState>,
    pub work_available: Condvar,
    pub shutdown: AtomicBool,
    pub started: AtomicBool,
    pub fatal: Mutex<Option<Error>>,
    pub timer_parker: Parker,
    pub watchdog_parker: Parker,
    next_task_id: AtomicU64,
    next_mutex_id: AtomicU64,
}

impl Core {
    pub fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler state poisoned")
    }

    /// Wakes all parked workers so ordering changes are picked up.
    ///
    /// Callers must not hold the state lock or any mutex internal lock.
    pub fn notify_workers(&self) {
        let _guard = self.lock_state();
        self.work_available.notify_all();
    }

    /// Parks the calling worker on the state lock until work may be
    /// available or `timeout` elapses.
    pub fn park_worker<'a>(
        &self,
        guard: MutexGuard<'a, SchedState>,
        timeout: Duration,
    ) -> MutexGuard<'a, SchedState> {
        let (guard, _timed_out) = self
            .work_available
            .wait_timeout(guard, timeout)
            .expect("scheduler state poisoned");
        guard
    }

    /// Ordering key of a task under the active policy, derived on read.
    pub fn order_key(&self, cell: &TaskCell) -> OrderKey {
        let dynstate = cell.lock();
        let urgency = match self.config.scheduling_policy {
            SchedPolicy::Edf => dynstate.next_deadline_abs,
            SchedPolicy::Rms => {
                if cell.period.is_zero() {
                    f64::INFINITY
                } else {
                    cell.period.as_secs_f64()
                }
            }
            SchedPolicy::Priority => 0.0,
        };
        OrderKey {
            urgency,
            priority: dynstate.effective_priority,
        }
    }
}

/// Builder for a [`Scheduler`] with custom configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ready-queue ordering policy.
    #[must_use]
    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.config.scheduling_policy = policy;
        self
    }

    /// Sets the number of worker threads (0 = available parallelism).
    #[must_use]
    pub fn parallelism(mut self, n: usize) -> Self {
        self.config.parallelism = n;
        self
    }

    /// Sets the soft-preemption tick period.
    #[must_use]
    pub fn preempt_quantum(mut self, quantum: Duration) -> Self {
        self.config.preempt_quantum = quantum;
        self
    }

    /// Sets the deadlock watchdog scan period.
    #[must_use]
    pub fn watchdog_period(mut self, period: Duration) -> Self {
        self.config.watchdog_period = period;
        self
    }

    /// Sets the default overrun policy.
    #[must_use]
    pub fn overrun_policy(mut self, policy: crate::config::OverrunPolicy) -> Self {
        self.config.overrun_policy = policy;
        self
    }

    /// Sets the per-task inbox capacity (0 = unbounded).
    #[must_use]
    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.config.inbox_capacity = capacity;
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the scheduler. Workers are not spawned until
    /// [`Scheduler::start`].
    #[must_use]
    pub fn build(self) -> Scheduler {
        let mut config = self.config;
        config.normalize();
        Scheduler {
            core: Arc::new(Core {
                config,
                clock: Clock::new(),
                state: Mutex::new(SchedState {
                    tasks: HashMap::new(),
                    by_name: HashMap::new(),
                    ready: ReadyQueue::new(),
                    sleepers: BinaryHeap::new(),
                    running: HashSet::new(),
                    mutexes: Vec::new(),
                }),
                work_available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                started: AtomicBool::new(false),
                fatal: Mutex::new(None),
                timer_parker: Parker::new(),
                watchdog_parker: Parker::new(),
                next_task_id: AtomicU64::new(1),
                next_mutex_id: AtomicU64::new(1),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }
}

/// The task scheduler.
///
/// ```no_run
/// use rtsched::{SchedPolicy, Scheduler, Task};
/// use std::time::Duration;
///
/// let sched = Scheduler::new(SchedPolicy::Edf);
/// sched.add_task(
///     Task::new("sensor", || { /* read sensor */ })
///         .period(Duration::from_millis(100))
///         .deadline(Duration::from_millis(50)),
/// )?;
/// sched.start()?;
/// # Ok::<(), rtsched::Error>(())
/// ```
pub struct Scheduler {
    core: Arc<Core>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler with the given policy and default configuration.
    #[must_use]
    pub fn new(policy: SchedPolicy) -> Self {
        Self::builder().policy(policy).build()
    }

    /// Returns a configuration builder.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// The active configuration (normalized).
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Registers a task.
    ///
    /// Periodic and one-shot tasks become READY immediately; event-driven
    /// tasks wait for [`trigger_task`](Self::trigger_task).
    pub fn add_task(&self, task: Task) -> Result<()> {
        self.check_fatal()?;
        if self.core.shutdown.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        let mut state = self.core.lock_state();
        if state.by_name.contains_key(task.name()) {
            return Err(Error::new(ErrorKind::DuplicateTask)
                .with_context(format!("task {:?}", task.name())));
        }
        let id = TaskId::from_raw(self.core.next_task_id.fetch_add(1, Ordering::Relaxed));
        let name = task.name().to_string();
        let event_driven = task.event_driven;
        let deadline = task.deadline.as_secs_f64();
        let cell = Arc::new(TaskCell::new(id, task, self.core.config.inbox_capacity));
        {
            let mut dynstate = cell.lock();
            if event_driven {
                dynstate.state = TaskState::WaitingEvent;
            } else {
                let now = self.core.clock.now();
                dynstate.state = TaskState::Ready;
                dynstate.next_release = now;
                dynstate.next_deadline_abs = if deadline > 0.0 {
                    now + deadline
                } else {
                    f64::INFINITY
                };
            }
        }
        state.by_name.insert(name.clone(), id);
        state.tasks.insert(id, cell);
        if !event_driven {
            state.ready.insert(id);
            self.core.work_available.notify_one();
        }
        tracing::info!(task = %name, event_driven, "task added");
        Ok(())
    }

    /// Unregisters a task.
    ///
    /// Cooperative: a run currently in progress completes; the terminate
    /// flag is observed at the next dispatch boundary. The name becomes
    /// available for re-registration immediately.
    pub fn remove_task(&self, name: &str) -> Result<()> {
        self.check_fatal()?;
        let mut state = self.core.lock_state();
        let id = state
            .by_name
            .remove(name)
            .ok_or_else(|| unknown_task(name))?;
        let cell = state
            .tasks
            .remove(&id)
            .expect("registry out of sync with name index");
        state.ready.remove(id);
        state.running.remove(&id);
        drop(state);
        cell.request_terminate();
        cell.lock().state = TaskState::Terminated;
        tracing::info!(task = %name, "task removed");
        Ok(())
    }

    /// Spawns the worker pool, the release/preemption timer, and the
    /// deadlock watchdog. Idempotent.
    pub fn start(&self) -> Result<()> {
        self.check_fatal()?;
        if self.core.shutdown.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        if self.core.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut handles = self.handles.lock().expect("handle list poisoned");
        for i in 0..self.core.config.parallelism {
            let core = Arc::clone(&self.core);
            let handle = std::thread::Builder::new()
                .name(format!("rtsched-worker-{i}"))
                .spawn(move || worker::run(&core, i))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        let core = Arc::clone(&self.core);
        handles.push(
            std::thread::Builder::new()
                .name("rtsched-timer".into())
                .spawn(move || timer::run(&core))
                .expect("failed to spawn timer thread"),
        );
        let core = Arc::clone(&self.core);
        handles.push(
            std::thread::Builder::new()
                .name("rtsched-watchdog".into())
                .spawn(move || watchdog::run(&core))
                .expect("failed to spawn watchdog thread"),
        );
        tracing::info!(
            policy = %self.core.config.scheduling_policy,
            workers = self.core.config.parallelism,
            "scheduler started"
        );
        Ok(())
    }

    /// Terminates every task, wakes all waiters, and joins the worker,
    /// timer and watchdog threads. Idempotent; the scheduler cannot be
    /// restarted afterwards.
    pub fn stop_all(&self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.core.lock_state();
            for cell in state.tasks.values() {
                cell.request_terminate();
                cell.lock().state = TaskState::Terminated;
            }
            state.tasks.clear();
            state.by_name.clear();
            state.ready.clear();
            state.sleepers.clear();
            state.running.clear();
            self.core.work_available.notify_all();
        }
        self.core.timer_parker.unpark();
        self.core.watchdog_parker.unpark();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("handle list poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("all tasks stopped");
    }

    /// Triggers an event-driven task.
    ///
    /// A waiting task becomes READY. Triggers landing while the task is
    /// READY coalesce into the queued run; triggers landing mid-run
    /// coalesce into one pending bit and the task re-runs once afterwards.
    pub fn trigger_task(&self, name: &str) -> Result<()> {
        self.check_fatal()?;
        trigger_by_core(&self.core, name)
    }

    /// Sends a message to the named task's inbox. Never blocks.
    pub fn send_message(&self, name: &str, msg: Message) -> Result<()> {
        self.check_fatal()?;
        self.cell(name)?.inbox.send(msg)
    }

    /// Receives the next message from the named task's inbox, waiting up
    /// to `timeout`.
    pub fn receive_message(&self, name: &str, timeout: Duration) -> Result<Message> {
        self.check_fatal()?;
        let cell = self.cell(name)?;
        // The state lock is not held across the wait.
        cell.inbox.receive(timeout)
    }

    /// Updates a task's base priority; effective priority re-derives from
    /// base and any live inheritance ceilings.
    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.check_fatal()?;
        let cell = self.cell(name)?;
        {
            let mut dynstate = cell.lock();
            dynstate.base_priority = priority;
            dynstate.rederive_priority();
        }
        self.core.notify_workers();
        tracing::debug!(task = %name, priority, "priority updated");
        Ok(())
    }

    /// Returns `(base, effective)` priority of the named task.
    pub fn priorities(&self, name: &str) -> Result<(i32, i32)> {
        let cell = self.cell(name)?;
        let dynstate = cell.lock();
        Ok((dynstate.base_priority, dynstate.effective_priority))
    }

    /// Returns the lifecycle state of the named task.
    pub fn task_state(&self, name: &str) -> Result<TaskState> {
        let cell = self.cell(name)?;
        let state = cell.lock().state;
        Ok(state)
    }

    /// Snapshot of the named task's execution counters.
    pub fn get_stats(&self, name: &str) -> Result<TaskStats> {
        let cell = self.cell(name)?;
        let stats = cell.lock().stats;
        Ok(stats)
    }

    /// Creates a priority-inheriting mutex registered with this
    /// scheduler's deadlock watchdog.
    #[must_use]
    pub fn create_mutex(&self) -> Arc<RtMutex> {
        let id = MutexId::from_raw(self.core.next_mutex_id.fetch_add(1, Ordering::Relaxed));
        let mutex = Arc::new(RtMutex::new(id, Arc::downgrade(&self.core)));
        self.core.lock_state().mutexes.push(Arc::downgrade(&mutex));
        mutex
    }

    /// Routes a host-OS signal to `trigger_task(name)`.
    ///
    /// The handler itself only writes to a wake pipe; a dedicated bridge
    /// thread performs the trigger.
    pub fn bind_signal(&self, signum: i32, name: &str) -> Result<()> {
        self.check_fatal()?;
        // Fail fast on unknown names; removal after binding downgrades
        // later deliveries to a logged warning.
        let _ = self.cell(name)?;
        signal_bridge::bind(&self.core, signum, name)
    }

    fn cell(&self, name: &str) -> Result<Arc<TaskCell>> {
        let state = self.core.lock_state();
        let id = state.by_name.get(name).ok_or_else(|| unknown_task(name))?;
        Ok(Arc::clone(
            state.tasks.get(id).expect("registry out of sync"),
        ))
    }

    fn check_fatal(&self) -> Result<()> {
        let fatal = self.core.fatal.lock().expect("fatal flag poisoned");
        match &*fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.lock_state();
        f.debug_struct("Scheduler")
            .field("policy", &self.core.config.scheduling_policy)
            .field("tasks", &state.tasks.len())
            .field("ready", &state.ready.len())
            .field("running", &state.running.len())
            .field("started", &self.core.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// Trigger path shared by `Scheduler::trigger_task` and the signal bridge
/// thread (which has no `Scheduler` handle).
pub(crate) fn trigger_by_core(core: &Arc<Core>, name: &str) -> Result<()> {
    let mut state = core.lock_state();
    let id = *state.by_name.get(name).ok_or_else(|| unknown_task(name))?;
    let cell = Arc::clone(state.tasks.get(&id).expect("registry out of sync"));
    if !cell.event_driven {
        return Err(Error::new(ErrorKind::NotEventDriven)
            .with_context(format!("task {name:?} is not event-driven")));
    }
    let mut dynstate = cell.lock();
    match dynstate.state {
        TaskState::WaitingEvent => {
            let now = core.clock.now();
            let deadline = cell.deadline.as_secs_f64();
            dynstate.state = TaskState::Ready;
            dynstate.next_release = now;
            dynstate.next_deadline_abs = if deadline > 0.0 {
                now + deadline
            } else {
                f64::INFINITY
            };
            drop(dynstate);
            state.ready.insert(id);
            core.work_available.notify_one();
            tracing::debug!(task = %name, "event task triggered");
        }
        // Mid-run triggers arrive after the run consumed its event, so one
        // follow-up run is owed; they coalesce into a single pending bit.
        TaskState::Running | TaskState::Sleeping | TaskState::WaitingMutex => {
            dynstate.pending_trigger = true;
        }
        // A READY task has an unconsumed trigger queued already; further
        // triggers coalesce into it.
        TaskState::Ready | TaskState::Created | TaskState::Terminated => {}
    }
    Ok(())
}

fn unknown_task(name: &str) -> Error {
    Error::new(ErrorKind::UnknownTask).with_context(format!("task {name:?}"))
}
