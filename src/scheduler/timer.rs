//! Release timer and soft-preemption tick.
//!
//! A dedicated thread owns the heap of pending periodic releases so that a
//! worker never sleeps out a period on behalf of a task. The same thread
//! fires the soft-preemption check every `preempt_quantum`: when the best
//! ready key beats a running task's key under the policy order, the running
//! task's yield hint is set for [`ctx::should_yield`](crate::ctx::should_yield)
//! to observe.

use crate::scheduler::{Core, SchedState};
use crate::task::TaskState;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn run(core: &Arc<Core>) {
    let quantum = core.config.preempt_quantum;
    tracing::trace!(?quantum, "timer started");
    while !core.shutdown.load(Ordering::Acquire) {
        let wait = {
            let mut state = core.lock_state();
            let now = core.clock.now();
            release_due(core, &mut state, now);
            preempt_scan(core, &state);

            // Wake for the nearest release or the next preemption tick,
            // whichever comes first.
            let mut wait = quantum;
            if let Some(sleeper) = state.sleepers.peek() {
                let until = sleeper.wake_at - now;
                if until < wait.as_secs_f64() {
                    wait = Duration::from_secs_f64(until.max(0.0));
                }
            }
            wait
        };
        core.timer_parker
            .park_timeout(wait.max(Duration::from_millis(1)));
    }
    tracing::trace!("timer exiting");
}

/// Moves every sleeper whose release time has arrived into the ready queue.
fn release_due(core: &Arc<Core>, state: &mut SchedState, now: f64) {
    while state
        .sleepers
        .peek()
        .is_some_and(|sleeper| sleeper.wake_at <= now)
    {
        let sleeper = state.sleepers.pop().expect("peeked sleeper vanished");
        // Entries for removed or terminated tasks are dropped lazily here.
        let Some(cell) = state.tasks.get(&sleeper.task).cloned() else {
            continue;
        };
        if cell.is_terminated() {
            continue;
        }
        {
            let mut dynstate = cell.lock();
            if dynstate.state != TaskState::Sleeping {
                continue;
            }
            dynstate.state = TaskState::Ready;
        }
        state.ready.insert(sleeper.task);
        core.work_available.notify_one();
        tracing::trace!(task = %cell.name, wake_at = sleeper.wake_at, "released");
    }
}

/// Sets the yield hint on running tasks that the best ready task outranks.
fn preempt_scan(core: &Arc<Core>, state: &SchedState) {
    if state.ready.is_empty() {
        return;
    }
    let Some(best) = state.ready.peek_best(|id| {
        state.tasks.get(&id).and_then(|cell| {
            if cell.is_terminated() {
                None
            } else {
                Some(core.order_key(cell))
            }
        })
    }) else {
        return;
    };
    for id in &state.running {
        let Some(cell) = state.tasks.get(id) else {
            continue;
        };
        let key = core.order_key(cell);
        if best.cmp(&key) == CmpOrdering::Less && !cell.yield_hint.swap(true, Ordering::AcqRel) {
            tracing::trace!(task = %cell.name, "yield hint set");
        }
    }
}
