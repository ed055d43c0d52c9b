//! Current-task context.
//!
//! The dispatcher installs the running task into a thread-local before
//! invoking its work function and restores the previous value afterwards.
//! Work functions use this surface to cooperate with the scheduler:
//! [`should_yield`] observes the soft-preemption hint, [`sleep`] parks the
//! task in SLEEPING state, [`current_task`] names the running task. The
//! same thread-local identifies the requester in mutex operations.

use crate::task::{TaskCell, TaskState};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskCell>>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped.
pub(crate) struct CtxGuard {
    prev: Option<Arc<TaskCell>>,
}

/// Installs `cell` as the current task for this thread.
pub(crate) fn enter(cell: Arc<TaskCell>) -> CtxGuard {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(cell));
    CtxGuard { prev }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Runs `f` with the current task cell, if one is installed.
pub(crate) fn with_current<R>(f: impl FnOnce(&Arc<TaskCell>) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(f))
}

/// Clone of the current task cell, if any.
pub(crate) fn current_cell() -> Option<Arc<TaskCell>> {
    with_current(Arc::clone)
}

/// Name of the task running on this thread, if any.
#[must_use]
pub fn current_task() -> Option<String> {
    with_current(|cell| cell.name.clone())
}

/// Returns true if the scheduler has asked the running task to yield.
///
/// Work functions structured as iterative steps can poll this between steps
/// and return early; the task is re-released normally. Always false outside
/// a task context.
#[must_use]
pub fn should_yield() -> bool {
    with_current(|cell| cell.yield_hint.load(Ordering::Acquire)).unwrap_or(false)
}

/// Parks the running task for `duration`.
///
/// The task transitions to SLEEPING for the duration and back to RUNNING
/// afterwards; accuracy is bounded by OS scheduling. Outside a task context
/// this is a plain thread sleep.
pub fn sleep(duration: Duration) {
    let cell = current_cell();
    if let Some(cell) = &cell {
        let mut inner = cell.lock();
        if inner.state == TaskState::Running {
            inner.state = TaskState::Sleeping;
        }
    }
    std::thread::sleep(duration);
    if let Some(cell) = &cell {
        let mut inner = cell.lock();
        if inner.state == TaskState::Sleeping {
            inner.state = TaskState::Running;
        }
    }
}
