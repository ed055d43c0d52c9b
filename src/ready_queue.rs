//! Policy-aware ready queue.
//!
//! The queue stores task ids plus an insertion sequence; ordering keys are
//! derived on read at pop time, so a task whose effective priority or
//! deadline mutates between insert and pop is picked up on the next
//! extraction without an explicit reorder pass.

use crate::task::TaskId;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Ordering key for one ready task under the active policy.
///
/// Lower `urgency` wins (absolute deadline for EDF, period for RMS, constant
/// for static priority); higher `priority` breaks urgency ties; the queue
/// breaks remaining ties by insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderKey {
    /// Policy-primary key, ascending. `f64::INFINITY` for "unbounded".
    pub urgency: f64,
    /// Effective priority, descending.
    pub priority: i32,
}

impl OrderKey {
    /// Compares two keys; `Ordering::Less` means "runs first".
    #[must_use]
    pub fn cmp(&self, other: &Self) -> Ordering {
        self.urgency
            .total_cmp(&other.urgency)
            .then(other.priority.cmp(&self.priority))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    task: TaskId,
    seq: u64,
}

/// The ready queue over runnable tasks.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: Vec<Entry>,
    /// Set of queued tasks (for dedup).
    queued: HashSet<TaskId>,
    next_seq: u64,
}

impl ReadyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Returns true if no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Inserts a task. Returns false if it was already queued.
    pub fn insert(&mut self, task: TaskId) -> bool {
        if !self.queued.insert(task) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { task, seq });
        true
    }

    /// Removes a specific task. Returns false if it was not queued.
    pub fn remove(&mut self, task: TaskId) -> bool {
        if !self.queued.remove(&task) {
            return false;
        }
        self.entries.retain(|e| e.task != task);
        true
    }

    /// Pops the best task under the caller-supplied key derivation.
    ///
    /// `key_of` returning `None` marks a stale entry (task no longer
    /// registered); stale entries are dropped during the scan.
    pub fn pop_best<F>(&mut self, mut key_of: F) -> Option<TaskId>
    where
        F: FnMut(TaskId) -> Option<OrderKey>,
    {
        let mut best: Option<(usize, OrderKey, u64)> = None;
        let mut i = 0;
        while i < self.entries.len() {
            let entry = self.entries[i];
            let Some(key) = key_of(entry.task) else {
                self.queued.remove(&entry.task);
                self.entries.remove(i);
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_key, best_seq)) => match key.cmp(best_key) {
                    Ordering::Less => true,
                    Ordering::Equal => entry.seq < *best_seq,
                    Ordering::Greater => false,
                },
            };
            if better {
                best = Some((i, key, entry.seq));
            }
            i += 1;
        }
        let (idx, _, _) = best?;
        let entry = self.entries.remove(idx);
        self.queued.remove(&entry.task);
        Some(entry.task)
    }

    /// Returns the best key without dequeuing (stale entries skipped).
    pub fn peek_best<F>(&self, mut key_of: F) -> Option<OrderKey>
    where
        F: FnMut(TaskId) -> Option<OrderKey>,
    {
        let mut best: Option<(OrderKey, u64)> = None;
        for entry in &self.entries {
            let Some(key) = key_of(entry.task) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_key, best_seq)) => match key.cmp(best_key) {
                    Ordering::Less => true,
                    Ordering::Equal => entry.seq < *best_seq,
                    Ordering::Greater => false,
                },
            };
            if better {
                best = Some((key, entry.seq));
            }
        }
        best.map(|(key, _)| key)
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::init_test_logging;
    use std::collections::HashMap;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn task(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    fn priority_key(p: i32) -> OrderKey {
        OrderKey {
            urgency: 0.0,
            priority: p,
        }
    }

    fn deadline_key(d: f64) -> OrderKey {
        OrderKey {
            urgency: d,
            priority: 0,
        }
    }

    #[test]
    fn pop_prefers_higher_priority() {
        init_test("pop_prefers_higher_priority");
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        queue.insert(task(2));
        let keys: HashMap<TaskId, OrderKey> =
            [(task(1), priority_key(1)), (task(2), priority_key(5))].into();

        let first = queue.pop_best(|t| keys.get(&t).copied());
        let second = queue.pop_best(|t| keys.get(&t).copied());
        crate::assert_with_log!(
            first == Some(task(2)),
            "higher priority pops first",
            Some(task(2)),
            first
        );
        crate::assert_with_log!(
            second == Some(task(1)),
            "lower priority pops second",
            Some(task(1)),
            second
        );
        crate::test_complete!("pop_prefers_higher_priority");
    }

    #[test]
    fn earlier_deadline_beats_priority() {
        init_test("earlier_deadline_beats_priority");
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        queue.insert(task(2));
        // Task 1: later deadline but higher priority; EDF urgency wins.
        let keys: HashMap<TaskId, OrderKey> = [
            (
                task(1),
                OrderKey {
                    urgency: 5.0,
                    priority: 9,
                },
            ),
            (
                task(2),
                OrderKey {
                    urgency: 1.0,
                    priority: 0,
                },
            ),
        ]
        .into();

        let first = queue.pop_best(|t| keys.get(&t).copied());
        crate::assert_with_log!(
            first == Some(task(2)),
            "earlier deadline pops first",
            Some(task(2)),
            first
        );
        crate::test_complete!("earlier_deadline_beats_priority");
    }

    #[test]
    fn ties_break_by_insertion_order() {
        init_test("ties_break_by_insertion_order");
        let mut queue = ReadyQueue::new();
        queue.insert(task(3));
        queue.insert(task(1));
        queue.insert(task(2));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_best(|_| Some(priority_key(7))))
            .collect();
        crate::assert_with_log!(
            order == vec![task(3), task(1), task(2)],
            "equal keys pop in insertion order",
            vec![task(3), task(1), task(2)],
            order
        );
        crate::test_complete!("ties_break_by_insertion_order");
    }

    #[test]
    fn key_mutation_between_insert_and_pop() {
        init_test("key_mutation_between_insert_and_pop");
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        queue.insert(task(2));

        // Priorities as inserted: task 1 wins.
        let mut keys: HashMap<TaskId, OrderKey> =
            [(task(1), priority_key(5)), (task(2), priority_key(1))].into();
        // Inheritance boosts task 2 before the pop; derived-on-read keys
        // must observe the boost.
        keys.insert(task(2), priority_key(9));

        let first = queue.pop_best(|t| keys.get(&t).copied());
        crate::assert_with_log!(
            first == Some(task(2)),
            "boosted task pops first",
            Some(task(2)),
            first
        );
        crate::test_complete!("key_mutation_between_insert_and_pop");
    }

    #[test]
    fn dedup_prevents_double_insert() {
        let mut queue = ReadyQueue::new();
        assert!(queue.insert(task(1)));
        assert!(!queue.insert(task(1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_unqueued_is_noop() {
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        assert!(!queue.remove(task(2)));
        assert!(queue.remove(task(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_entries_are_dropped() {
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        queue.insert(task(2));
        // Task 1 disappeared from the registry.
        let keys: HashMap<TaskId, OrderKey> = [(task(2), deadline_key(1.0))].into();
        let first = queue.pop_best(|t| keys.get(&t).copied());
        assert_eq!(first, Some(task(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_does_not_dequeue() {
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        let key = queue.peek_best(|_| Some(deadline_key(2.0)));
        assert_eq!(key, Some(deadline_key(2.0)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn infinite_urgency_sorts_last() {
        let mut queue = ReadyQueue::new();
        queue.insert(task(1));
        queue.insert(task(2));
        let keys: HashMap<TaskId, OrderKey> = [
            (task(1), deadline_key(f64::INFINITY)),
            (task(2), deadline_key(10.0)),
        ]
        .into();
        let first = queue.pop_best(|t| keys.get(&t).copied());
        assert_eq!(first, Some(task(2)));
    }
}
