//! Deadlock watchdog.
//!
//! A background thread periodically snapshots the wait-for graph ("task T
//! waits on a mutex whose owner is T'"). Because a task has at most one
//! outstanding acquire, every node has out-degree at most one and cycle
//! detection reduces to pointer chasing with a visited set. On a cycle the
//! watchdog reports it and aborts the acquire of the lowest-base-priority
//! member; the victim's `acquire` fails with `Deadlock`. The mutex itself
//! is never force-released.
//!
//! Scan panics are contained; repeated failures poison the scheduler and
//! surface as `Fatal` on the next API call.

use crate::error::{Error, ErrorKind};
use crate::scheduler::Core;
use crate::task::{TaskCell, TaskId};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Consecutive scan failures tolerated before the scheduler is poisoned.
const MAX_FAILURES: u32 = 3;

pub(crate) fn run(core: &Arc<Core>) {
    let period = core.config.watchdog_period;
    tracing::trace!(?period, "watchdog started");
    let mut failures = 0u32;
    loop {
        core.watchdog_parker.park_timeout(period);
        if core.shutdown.load(Ordering::Acquire) {
            break;
        }
        match catch_unwind(AssertUnwindSafe(|| scan(core))) {
            Ok(()) => failures = 0,
            Err(_) => {
                failures += 1;
                tracing::error!(failures, "watchdog scan panicked");
                if failures >= MAX_FAILURES {
                    *core.fatal.lock().expect("fatal flag poisoned") = Some(
                        Error::new(ErrorKind::Fatal)
                            .with_context("deadlock watchdog failed repeatedly"),
                    );
                    core.shutdown.store(true, Ordering::Release);
                    core.notify_workers();
                    core.timer_parker.unpark();
                    break;
                }
            }
        }
    }
    tracing::trace!("watchdog exiting");
}

fn scan(core: &Arc<Core>) {
    let (edges, cells) = {
        let mut state = core.lock_state();
        state.mutexes.retain(|weak| weak.upgrade().is_some());
        let mutexes: Vec<_> = state.mutexes.iter().filter_map(std::sync::Weak::upgrade).collect();

        // State lock before each mutex's internal lock, per the lock order.
        let mut edges: HashMap<TaskId, TaskId> = HashMap::new();
        for mutex in &mutexes {
            if let Some((owner, waiters)) = mutex.wait_edges() {
                for waiter in waiters {
                    edges.insert(waiter, owner);
                }
            }
        }
        let cells: HashMap<TaskId, Arc<TaskCell>> = state.tasks.clone();
        (edges, cells)
    };

    let Some(cycle) = find_cycle(&edges) else {
        return;
    };

    let victim = cycle
        .iter()
        .filter_map(|id| cells.get(id))
        .min_by_key(|cell| (cell.lock().base_priority, cell.id));
    let Some(victim) = victim else {
        return;
    };

    let names: Vec<&str> = cycle
        .iter()
        .filter_map(|id| cells.get(id).map(|c| c.name.as_str()))
        .collect();
    tracing::warn!(
        cycle = ?names,
        victim = %victim.name,
        "deadlock detected, aborting lowest-priority acquire"
    );

    victim.lock().abort_acquire = true;
    victim.grant.unpark();
}

/// Finds a cycle in a wait-for graph with out-degree at most one.
///
/// Returns the members of the first cycle found, in chain order.
pub(crate) fn find_cycle(edges: &HashMap<TaskId, TaskId>) -> Option<Vec<TaskId>> {
    let mut visited: HashSet<TaskId> = HashSet::new();
    for &start in edges.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut path: Vec<TaskId> = Vec::new();
        let mut on_path: HashSet<TaskId> = HashSet::new();
        let mut node = start;
        loop {
            if on_path.contains(&node) {
                let pos = path
                    .iter()
                    .position(|t| *t == node)
                    .expect("cycle entry not on path");
                return Some(path[pos..].to_vec());
            }
            if visited.contains(&node) {
                // Joins a chain already proven acyclic.
                break;
            }
            visited.insert(node);
            on_path.insert(node);
            path.push(node);
            match edges.get(&node) {
                Some(next) => node = *next,
                None => break,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn empty_graph_has_no_cycle() {
        assert_eq!(find_cycle(&HashMap::new()), None);
    }

    #[test]
    fn chain_has_no_cycle() {
        // 1 -> 2 -> 3 (3 holds but waits on nothing)
        let edges = HashMap::from([(t(1), t(2)), (t(2), t(3))]);
        assert_eq!(find_cycle(&edges), None);
    }

    #[test]
    fn two_task_cycle_detected() {
        let edges = HashMap::from([(t(1), t(2)), (t(2), t(1))]);
        let cycle = find_cycle(&edges).expect("cycle missed");
        let set: HashSet<_> = cycle.into_iter().collect();
        assert_eq!(set, HashSet::from([t(1), t(2)]));
    }

    #[test]
    fn three_task_cycle_detected() {
        let edges = HashMap::from([(t(1), t(2)), (t(2), t(3)), (t(3), t(1))]);
        let cycle = find_cycle(&edges).expect("cycle missed");
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn tail_leading_into_cycle_excluded() {
        // 4 -> 1 -> 2 -> 1: the cycle is {1, 2}, not including 4.
        let edges = HashMap::from([(t(4), t(1)), (t(1), t(2)), (t(2), t(1))]);
        let cycle = find_cycle(&edges).expect("cycle missed");
        let set: HashSet<_> = cycle.into_iter().collect();
        assert_eq!(set, HashSet::from([t(1), t(2)]));
    }

    #[test]
    fn disjoint_chains_and_cycle() {
        let edges = HashMap::from([
            (t(1), t(2)),
            (t(5), t(6)),
            (t(6), t(7)),
            (t(7), t(5)),
        ]);
        let cycle = find_cycle(&edges).expect("cycle missed");
        let set: HashSet<_> = cycle.into_iter().collect();
        assert_eq!(set, HashSet::from([t(5), t(6), t(7)]));
    }
}
