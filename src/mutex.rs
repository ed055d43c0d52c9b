//! Priority-inheriting mutex with explicit owner identity.
//!
//! Unlike `std::sync::Mutex`, ownership belongs to a *task*, not a guard:
//! the holder is raised to the effective priority of its highest waiter
//! (bounding priority inversion to the holder's critical section) and
//! restored on release. Release hands the mutex to the highest-effective-
//! priority waiter, FIFO on ties.
//!
//! Mutexes are created through [`Scheduler::create_mutex`](crate::Scheduler::create_mutex)
//! so the deadlock watchdog can enumerate them. Recursive acquisition is an
//! error, and a task may have at most one outstanding acquire.

use crate::ctx;
use crate::error::{Error, ErrorKind, Result};
use crate::task::{TaskCell, TaskId, TaskState};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

/// Scheduler-assigned mutex identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutexId(u64);

impl MutexId {
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

/// Re-check cadence while blocked, so terminate/abort flags are never
/// missed even if an unpark races the park.
const WAIT_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct OwnerSlot {
    id: TaskId,
    cell: Weak<TaskCell>,
    /// The owner's effective priority at the moment of acquisition.
    saved_priority: i32,
}

#[derive(Debug)]
struct WaiterSlot {
    id: TaskId,
    cell: Weak<TaskCell>,
}

#[derive(Debug, Default)]
struct MutexInner {
    owner: Option<OwnerSlot>,
    /// Insertion order; the effective-priority scan happens on read so a
    /// waiter boosted after enqueueing is still picked correctly.
    waiters: Vec<WaiterSlot>,
}

/// A priority-inheriting mutex.
pub struct RtMutex {
    id: MutexId,
    core: Weak<crate::scheduler::Core>,
    inner: StdMutex<MutexInner>,
}

impl RtMutex {
    pub(crate) fn new(id: MutexId, core: Weak<crate::scheduler::Core>) -> Self {
        Self {
            id,
            core,
            inner: StdMutex::new(MutexInner::default()),
        }
    }

    /// The mutex id.
    #[must_use]
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Name of the owning task, if any.
    #[must_use]
    pub fn owner_name(&self) -> Option<String> {
        let inner = self.lock_inner();
        inner
            .owner
            .as_ref()
            .and_then(|o| o.cell.upgrade())
            .map(|c| c.name.clone())
    }

    /// Acquires the mutex for the task running on this thread.
    ///
    /// Blocks while another task owns the mutex. Fails with
    /// `RecursiveAcquire` if the caller already owns it, `NotRunning` when
    /// called outside a task context, `Deadlock` if the watchdog aborts the
    /// wait, and `Shutdown` if the task is terminated while waiting.
    pub fn acquire(&self) -> Result<()> {
        let cell = ctx::current_cell().ok_or_else(|| {
            Error::new(ErrorKind::NotRunning).with_context("mutex acquire outside a task")
        })?;
        self.acquire_for(&cell)
    }

    /// Releases the mutex held by the task running on this thread.
    ///
    /// Fails with `NotOwner` when the caller does not own the mutex.
    pub fn release(&self) -> Result<()> {
        let cell = ctx::current_cell().ok_or_else(|| {
            Error::new(ErrorKind::NotRunning).with_context("mutex release outside a task")
        })?;
        self.release_for(&cell)
    }

    pub(crate) fn acquire_for(&self, cell: &Arc<TaskCell>) -> Result<()> {
        let boosted = {
            let mut inner = self.lock_inner();
            match &inner.owner {
                None => {
                    let saved = {
                        let mut dynstate = cell.lock();
                        dynstate.held.push(self.id);
                        dynstate.effective_priority
                    };
                    inner.owner = Some(OwnerSlot {
                        id: cell.id,
                        cell: Arc::downgrade(cell),
                        saved_priority: saved,
                    });
                    tracing::debug!(task = %cell.name, mutex = self.id.raw(), "mutex acquired");
                    return Ok(());
                }
                Some(owner) if owner.id == cell.id => {
                    return Err(Error::new(ErrorKind::RecursiveAcquire)
                        .with_context(format!("{} already owns this mutex", cell.name)));
                }
                Some(_) => {}
            }

            let my_effective = {
                let mut dynstate = cell.lock();
                dynstate.state = TaskState::WaitingMutex;
                dynstate.waiting_on = Some(self.id);
                dynstate.abort_acquire = false;
                dynstate.effective_priority
            };
            inner.waiters.push(WaiterSlot {
                id: cell.id,
                cell: Arc::downgrade(cell),
            });
            tracing::debug!(
                task = %cell.name,
                mutex = self.id.raw(),
                owner = ?inner.owner.as_ref().and_then(|o| o.cell.upgrade()).map(|c| c.name.clone()),
                "mutex contended, waiting"
            );
            self.boost_owner(&inner, my_effective)
        };
        if boosted {
            self.notify_scheduler();
        }

        loop {
            cell.grant.park_timeout(WAIT_RECHECK);

            {
                let inner = self.lock_inner();
                if inner.owner.as_ref().is_some_and(|o| o.id == cell.id) {
                    return Ok(());
                }
            }

            let aborted = {
                let mut dynstate = cell.lock();
                std::mem::take(&mut dynstate.abort_acquire)
            };
            if aborted {
                // A handoff may have raced the abort; ownership wins.
                if !self.cancel_wait(cell) {
                    return Ok(());
                }
                return Err(Error::new(ErrorKind::Deadlock)
                    .with_context("acquire aborted by deadlock watchdog"));
            }
            if cell.is_terminated() {
                if !self.cancel_wait(cell) {
                    return Ok(());
                }
                return Err(Error::new(ErrorKind::Shutdown)
                    .with_context("task terminated while waiting for mutex"));
            }
        }
    }

    pub(crate) fn release_for(&self, cell: &Arc<TaskCell>) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            match &inner.owner {
                Some(owner) if owner.id == cell.id => {}
                _ => {
                    return Err(Error::new(ErrorKind::NotOwner)
                        .with_context(format!("{} does not own this mutex", cell.name)));
                }
            }

            // Restore the releaser: this mutex no longer contributes a
            // ceiling, so effective falls back to max(base, other ceilings).
            {
                let mut dynstate = cell.lock();
                dynstate.held.retain(|m| *m != self.id);
                dynstate.set_ceiling(self.id, None);
            }
            inner.owner = None;

            // Hand off to the highest-effective-priority live waiter; the
            // scan reads each waiter's current priority, FIFO on ties.
            inner.waiters.retain(|w| w.cell.upgrade().is_some());
            let mut best: Option<(usize, i32)> = None;
            for (i, waiter) in inner.waiters.iter().enumerate() {
                let Some(wc) = waiter.cell.upgrade() else {
                    continue;
                };
                if wc.is_terminated() {
                    continue;
                }
                let effective = wc.lock().effective_priority;
                if best.map_or(true, |(_, b)| effective > b) {
                    best = Some((i, effective));
                }
            }

            if let Some((idx, effective)) = best {
                let waiter = inner.waiters.remove(idx);
                if let Some(next) = waiter.cell.upgrade() {
                    {
                        let mut dynstate = next.lock();
                        dynstate.held.push(self.id);
                        dynstate.waiting_on = None;
                        dynstate.abort_acquire = false;
                        if dynstate.state == TaskState::WaitingMutex {
                            dynstate.state = TaskState::Running;
                        }
                    }
                    inner.owner = Some(OwnerSlot {
                        id: next.id,
                        cell: waiter.cell,
                        saved_priority: effective,
                    });
                    // Remaining waiters may still hold the new owner above
                    // its base.
                    self.refresh_owner_ceiling(&inner);
                    tracing::debug!(from = %cell.name, to = %next.name, mutex = self.id.raw(), "mutex handoff");
                    next.grant.unpark();
                }
            } else {
                tracing::debug!(task = %cell.name, mutex = self.id.raw(), "mutex released");
            }
        }
        self.notify_scheduler();
        Ok(())
    }

    /// Owner id and waiter ids, for the deadlock watchdog.
    pub(crate) fn wait_edges(&self) -> Option<(TaskId, Vec<TaskId>)> {
        let inner = self.lock_inner();
        let owner = inner.owner.as_ref()?.id;
        let waiters = inner.waiters.iter().map(|w| w.id).collect();
        Some((owner, waiters))
    }

    #[cfg(test)]
    pub(crate) fn owner_saved_priority(&self) -> Option<i32> {
        self.lock_inner().owner.as_ref().map(|o| o.saved_priority)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MutexInner> {
        self.inner.lock().expect("mutex state poisoned")
    }

    /// Raises the owner's ceiling for this mutex to at least `waiter_eff`.
    /// Returns true if the owner's effective priority changed.
    fn boost_owner(&self, inner: &MutexInner, waiter_eff: i32) -> bool {
        let Some(owner) = inner.owner.as_ref() else {
            return false;
        };
        let Some(owner_cell) = owner.cell.upgrade() else {
            return false;
        };
        let mut dynstate = owner_cell.lock();
        let before = dynstate.effective_priority;
        let current = dynstate
            .inherited
            .iter()
            .find(|(m, _)| *m == self.id)
            .map(|(_, p)| *p);
        let ceiling = current.map_or(waiter_eff, |c| c.max(waiter_eff));
        dynstate.set_ceiling(self.id, Some(ceiling));
        let after = dynstate.effective_priority;
        if after != before {
            tracing::debug!(
                owner = %owner_cell.name,
                from = before,
                to = after,
                mutex = self.id.raw(),
                "priority inherited"
            );
        }
        after != before
    }

    /// Recomputes the owner's ceiling from the current waiter set.
    fn refresh_owner_ceiling(&self, inner: &MutexInner) {
        let Some(owner) = inner.owner.as_ref() else {
            return;
        };
        let Some(owner_cell) = owner.cell.upgrade() else {
            return;
        };
        let mut ceiling: Option<i32> = None;
        for waiter in &inner.waiters {
            if let Some(wc) = waiter.cell.upgrade() {
                let effective = wc.lock().effective_priority;
                ceiling = Some(ceiling.map_or(effective, |c| c.max(effective)));
            }
        }
        owner_cell.lock().set_ceiling(self.id, ceiling);
    }

    /// Removes `cell` from the waiter set after an aborted wait and drops
    /// the ceiling it contributed.
    ///
    /// Returns false if a concurrent handoff already made `cell` the owner;
    /// the caller must then treat the acquire as successful.
    fn cancel_wait(&self, cell: &Arc<TaskCell>) -> bool {
        let mut inner = self.lock_inner();
        if inner.owner.as_ref().is_some_and(|o| o.id == cell.id) {
            return false;
        }
        inner.waiters.retain(|w| w.id != cell.id);
        {
            let mut dynstate = cell.lock();
            dynstate.waiting_on = None;
            if dynstate.state == TaskState::WaitingMutex {
                dynstate.state = TaskState::Running;
            }
        }
        self.refresh_owner_ceiling(&inner);
        true
    }

    fn notify_scheduler(&self) {
        if let Some(core) = self.core.upgrade() {
            core.notify_workers();
        }
    }
}

impl std::fmt::Debug for RtMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("RtMutex")
            .field("id", &self.id)
            .field("owner", &inner.owner.as_ref().map(|o| o.id))
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::test_util::init_test_logging;
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn cell(id: u64, name: &str, priority: i32) -> Arc<TaskCell> {
        let cell = Arc::new(TaskCell::new(
            TaskId::from_raw(id),
            Task::new(name, || {}).priority(priority),
            0,
        ));
        cell.lock().state = TaskState::Running;
        cell
    }

    fn mutex() -> RtMutex {
        RtMutex::new(MutexId::from_raw(1), Weak::new())
    }

    #[test]
    fn uncontended_acquire_and_release() {
        init_test("uncontended_acquire_and_release");
        let m = mutex();
        let t1 = cell(1, "t1", 2);

        m.acquire_for(&t1).unwrap();
        assert_eq!(m.owner_name().as_deref(), Some("t1"));
        assert_eq!(m.owner_saved_priority(), Some(2));
        assert_eq!(t1.lock().held, vec![MutexId::from_raw(1)]);

        m.release_for(&t1).unwrap();
        assert_eq!(m.owner_name(), None);
        assert!(t1.lock().held.is_empty());
        crate::test_complete!("uncontended_acquire_and_release");
    }

    #[test]
    fn recursive_acquire_fails() {
        let m = mutex();
        let t1 = cell(1, "t1", 2);
        m.acquire_for(&t1).unwrap();
        let err = m.acquire_for(&t1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecursiveAcquire);
        // Still owned; release works.
        m.release_for(&t1).unwrap();
    }

    #[test]
    fn release_by_non_owner_fails() {
        let m = mutex();
        let t1 = cell(1, "t1", 2);
        let t2 = cell(2, "t2", 3);
        m.acquire_for(&t1).unwrap();
        let err = m.release_for(&t2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOwner);
        m.release_for(&t1).unwrap();
        // Releasing an unowned mutex also fails.
        let err = m.release_for(&t1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOwner);
    }

    #[test]
    fn contended_acquire_inherits_priority() {
        init_test("contended_acquire_inherits_priority");
        let m = Arc::new(mutex());
        let low = cell(1, "low", 1);
        let high = cell(2, "high", 5);

        m.acquire_for(&low).unwrap();

        let m2 = Arc::clone(&m);
        let high2 = Arc::clone(&high);
        let waiter = thread::spawn(move || m2.acquire_for(&high2));

        // Wait for the waiter to enqueue and boost the owner.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while low.lock().effective_priority != 5 {
            assert!(std::time::Instant::now() < deadline, "boost never happened");
            thread::sleep(Duration::from_millis(5));
        }
        crate::assert_with_log!(
            low.lock().effective_priority == 5,
            "owner inherits waiter priority",
            5,
            low.lock().effective_priority
        );
        assert_eq!(high.lock().state, TaskState::WaitingMutex);
        assert_eq!(high.lock().waiting_on, Some(MutexId::from_raw(1)));

        m.release_for(&low).unwrap();
        waiter.join().unwrap().unwrap();

        // Ownership transferred, priorities restored.
        assert_eq!(m.owner_name().as_deref(), Some("high"));
        assert_eq!(m.owner_saved_priority(), Some(5));
        crate::assert_with_log!(
            low.lock().effective_priority == 1,
            "owner restored to base after release",
            1,
            low.lock().effective_priority
        );
        assert_eq!(high.lock().state, TaskState::Running);
        assert_eq!(high.lock().waiting_on, None);

        m.release_for(&high).unwrap();
        crate::test_complete!("contended_acquire_inherits_priority");
    }

    #[test]
    fn handoff_prefers_highest_waiter() {
        init_test("handoff_prefers_highest_waiter");
        let m = Arc::new(mutex());
        let holder = cell(1, "holder", 1);
        let mid = cell(2, "mid", 2);
        let high = cell(3, "high", 5);

        m.acquire_for(&holder).unwrap();

        let m_mid = Arc::clone(&m);
        let mid2 = Arc::clone(&mid);
        let w_mid = thread::spawn(move || m_mid.acquire_for(&mid2));
        thread::sleep(Duration::from_millis(50));

        let m_high = Arc::clone(&m);
        let high2 = Arc::clone(&high);
        let w_high = thread::spawn(move || m_high.acquire_for(&high2));
        thread::sleep(Duration::from_millis(50));

        // Owner carries the maximum waiter priority.
        assert_eq!(holder.lock().effective_priority, 5);

        m.release_for(&holder).unwrap();
        w_high.join().unwrap().unwrap();
        assert_eq!(m.owner_name().as_deref(), Some("high"));

        // The remaining waiter still boosts the new owner.
        assert_eq!(high.lock().effective_priority, 5);

        m.release_for(&high).unwrap();
        w_mid.join().unwrap().unwrap();
        assert_eq!(m.owner_name().as_deref(), Some("mid"));
        m.release_for(&mid).unwrap();
        crate::test_complete!("handoff_prefers_highest_waiter");
    }

    #[test]
    fn equal_priority_waiters_are_fifo() {
        let m = Arc::new(mutex());
        let holder = cell(1, "holder", 1);
        let first = cell(2, "first", 3);
        let second = cell(3, "second", 3);

        m.acquire_for(&holder).unwrap();

        let m1 = Arc::clone(&m);
        let f = Arc::clone(&first);
        let w1 = thread::spawn(move || m1.acquire_for(&f));
        thread::sleep(Duration::from_millis(50));

        let m2 = Arc::clone(&m);
        let s = Arc::clone(&second);
        let w2 = thread::spawn(move || m2.acquire_for(&s));
        thread::sleep(Duration::from_millis(50));

        m.release_for(&holder).unwrap();
        w1.join().unwrap().unwrap();
        assert_eq!(m.owner_name().as_deref(), Some("first"));

        m.release_for(&first).unwrap();
        w2.join().unwrap().unwrap();
        assert_eq!(m.owner_name().as_deref(), Some("second"));
        m.release_for(&second).unwrap();
    }

    #[test]
    fn abort_flag_cancels_wait_and_restores_ceiling() {
        init_test("abort_flag_cancels_wait_and_restores_ceiling");
        let m = Arc::new(mutex());
        let low = cell(1, "low", 1);
        let high = cell(2, "high", 5);

        m.acquire_for(&low).unwrap();

        let m2 = Arc::clone(&m);
        let high2 = Arc::clone(&high);
        let waiter = thread::spawn(move || m2.acquire_for(&high2));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while low.lock().effective_priority != 5 {
            assert!(std::time::Instant::now() < deadline, "boost never happened");
            thread::sleep(Duration::from_millis(5));
        }

        // Watchdog-style abort.
        high.lock().abort_acquire = true;
        high.grant.unpark();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);

        // Waiter gone: ceiling dropped, owner unchanged.
        assert_eq!(low.lock().effective_priority, 1);
        assert_eq!(m.owner_name().as_deref(), Some("low"));
        assert_eq!(high.lock().waiting_on, None);

        m.release_for(&low).unwrap();
        crate::test_complete!("abort_flag_cancels_wait_and_restores_ceiling");
    }

    #[test]
    fn terminated_waiter_unblocks_with_shutdown() {
        let m = Arc::new(mutex());
        let holder = cell(1, "holder", 1);
        let doomed = cell(2, "doomed", 2);

        m.acquire_for(&holder).unwrap();

        let m2 = Arc::clone(&m);
        let doomed2 = Arc::clone(&doomed);
        let waiter = thread::spawn(move || m2.acquire_for(&doomed2));
        thread::sleep(Duration::from_millis(50));

        doomed.request_terminate();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shutdown);

        m.release_for(&holder).unwrap();
        assert_eq!(m.owner_name(), None);
    }

    #[test]
    fn acquire_outside_task_context_fails() {
        let m = mutex();
        assert_eq!(m.acquire().unwrap_err().kind(), ErrorKind::NotRunning);
        assert_eq!(m.release().unwrap_err().kind(), ErrorKind::NotRunning);
    }
}
