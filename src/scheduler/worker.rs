//! Worker thread dispatch loop.
//!
//! Each worker pops the best runnable task under the active policy, runs
//! its work function (panics are caught and counted, never fatal to the
//! worker), updates stats, applies the overrun policy, and computes the
//! task's next state: re-queue (pending trigger), sleep until the next
//! release (periodic), wait for a trigger (event-driven), or terminate
//! (one-shot, `max_runs`, removal, overrun policy).

use crate::config::OverrunPolicy;
use crate::ctx;
use crate::scheduler::{Core, SchedState, Sleeper};
use crate::task::{TaskCell, TaskState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Bound on an idle park; notifications normally cut waits far shorter.
const IDLE_PARK: Duration = Duration::from_millis(100);

/// What the dispatcher does with a task after a run completes.
enum NextStep {
    /// Pending trigger: straight back into the ready queue.
    Requeue,
    /// Periodic: wait for the release at the given absolute time.
    Sleep(f64),
    /// Event-driven with no pending trigger.
    AwaitEvent,
    Terminate,
}

pub(crate) fn run(core: &Arc<Core>, worker_id: usize) {
    tracing::trace!(worker = worker_id, "worker started");
    loop {
        if core.shutdown.load(Ordering::Acquire) {
            break;
        }
        let next = {
            let mut state = core.lock_state();
            match pop_ready(core, &mut state) {
                Some(cell) => Some(cell),
                None => {
                    let state = core.park_worker(state, IDLE_PARK);
                    drop(state);
                    None
                }
            }
        };
        if let Some(cell) = next {
            execute(core, &cell);
        }
    }
    tracing::trace!(worker = worker_id, "worker exiting");
}

/// Pops the best ready task and marks it RUNNING. Keys are derived on read,
/// so priority or deadline changes since insertion are honored here.
fn pop_ready(core: &Arc<Core>, state: &mut SchedState) -> Option<Arc<TaskCell>> {
    let SchedState {
        ready,
        tasks,
        running,
        ..
    } = state;
    let id = ready.pop_best(|id| {
        tasks.get(&id).and_then(|cell| {
            if cell.is_terminated() {
                None
            } else {
                Some(core.order_key(cell))
            }
        })
    })?;
    let cell = Arc::clone(tasks.get(&id)?);
    cell.lock().state = TaskState::Running;
    cell.yield_hint.store(false, Ordering::Release);
    running.insert(id);
    Some(cell)
}

fn execute(core: &Arc<Core>, cell: &Arc<TaskCell>) {
    let _ctx = ctx::enter(Arc::clone(cell));
    let start = core.clock.now();
    tracing::trace!(task = %cell.name, "dispatch");
    let outcome = catch_unwind(AssertUnwindSafe(|| (cell.work)()));
    let end = core.clock.now();
    let runtime = end - start;

    let overrun_policy = cell.overrun_override.unwrap_or(core.config.overrun_policy);
    let deadline = cell.deadline.as_secs_f64();

    let next = {
        let mut dynstate = cell.lock();
        dynstate.stats.record_run(runtime);
        if outcome.is_err() {
            dynstate.stats.record_error();
            tracing::error!(task = %cell.name, "work function panicked");
        }

        let mut kill = false;
        if deadline > 0.0 && runtime > deadline {
            dynstate.stats.record_overrun();
            tracing::warn!(
                task = %cell.name,
                runtime,
                deadline,
                policy = ?overrun_policy,
                "deadline overrun"
            );
            match overrun_policy {
                OverrunPolicy::Warn => {}
                OverrunPolicy::SkipNext => dynstate.skip_next = true,
                OverrunPolicy::Terminate => kill = true,
            }
        }
        if cell.max_runs.is_some_and(|limit| dynstate.stats.runs >= limit) {
            kill = true;
        }

        if cell.is_terminated() || kill {
            dynstate.state = TaskState::Terminated;
            NextStep::Terminate
        } else if cell.event_driven {
            if std::mem::take(&mut dynstate.pending_trigger) {
                dynstate.state = TaskState::Ready;
                dynstate.next_release = end;
                dynstate.next_deadline_abs = if deadline > 0.0 {
                    end + deadline
                } else {
                    f64::INFINITY
                };
                NextStep::Requeue
            } else {
                dynstate.state = TaskState::WaitingEvent;
                NextStep::AwaitEvent
            }
        } else if !cell.period.is_zero() {
            let period = cell.period.as_secs_f64();
            // Anchor on the scheduled release, not the actual start, so
            // periodic tasks do not drift.
            let mut release = (dynstate.next_release + period).max(end);
            if std::mem::take(&mut dynstate.skip_next) {
                release += period;
            }
            dynstate.next_release = release;
            dynstate.next_deadline_abs = if deadline > 0.0 {
                release + deadline
            } else {
                f64::INFINITY
            };
            dynstate.state = TaskState::Sleeping;
            NextStep::Sleep(release)
        } else {
            dynstate.state = TaskState::Terminated;
            NextStep::Terminate
        }
    };

    let mut state = core.lock_state();
    state.running.remove(&cell.id);
    match next {
        NextStep::Requeue => {
            state.ready.insert(cell.id);
            core.work_available.notify_one();
        }
        NextStep::Sleep(wake_at) => {
            state.sleepers.push(Sleeper {
                wake_at,
                task: cell.id,
            });
            drop(state);
            core.timer_parker.unpark();
        }
        NextStep::AwaitEvent => {}
        NextStep::Terminate => {
            tracing::debug!(task = %cell.name, "task terminated");
        }
    }
}
