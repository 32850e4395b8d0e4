//! Pending queue with optional priority ordering and stable FIFO tie-break.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::util::serde::{Priority, TaskId};

/// A queued task reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    /// Queued task.
    pub task_id: TaskId,
    /// Priority at submission time.
    pub priority: Priority,
    /// Submission sequence number; lower was submitted earlier.
    pub seq: u64,
}

/// Wrapper to make entries orderable by priority (highest first) and FIFO within priority.
#[derive(Debug)]
struct Ranked {
    entry: QueueEntry,
    by_priority: bool,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        let fifo = other.entry.seq.cmp(&self.entry.seq);
        if !self.by_priority {
            return fifo;
        }
        match self.entry.priority.rank().cmp(&other.entry.priority.rank()) {
            Ordering::Equal => fifo,
            ord => ord,
        }
    }
}

/// Pending queue backed by a binary heap: O(log n) push and pop.
#[derive(Debug)]
pub struct PendingQueue {
    heap: BinaryHeap<Ranked>,
    by_priority: bool,
}

impl PendingQueue {
    /// Create an empty queue; `by_priority = false` gives plain FIFO.
    #[must_use]
    pub fn new(by_priority: bool) -> Self {
        Self {
            heap: BinaryHeap::new(),
            by_priority,
        }
    }

    /// Insert an entry at its ordered position.
    pub fn push(&mut self, entry: QueueEntry) {
        self.heap.push(Ranked {
            entry,
            by_priority: self.by_priority,
        });
    }

    /// Remove and return the head.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop().map(|r| r.entry)
    }

    /// Remove a specific task. Returns whether it was queued.
    pub fn remove(&mut self, task_id: &TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|r| r.entry.task_id != *task_id);
        self.heap.len() != before
    }

    /// Whether the task is queued.
    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.heap.iter().any(|r| r.entry.task_id == *task_id)
    }

    /// Entries in dequeue order.
    #[must_use]
    pub fn ordered(&self) -> Vec<QueueEntry> {
        let mut ranked: Vec<&Ranked> = self.heap.iter().collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked.into_iter().map(|r| r.entry).collect()
    }

    /// Drop every entry, returning them in dequeue order.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        let entries = self.ordered();
        self.heap.clear();
        entries
    }

    /// Toggle priority ordering and re-sort existing entries.
    pub fn set_priority_ordering(&mut self, by_priority: bool) {
        if self.by_priority == by_priority {
            return;
        }
        self.by_priority = by_priority;
        let entries: Vec<QueueEntry> = self.heap.drain().map(|r| r.entry).collect();
        for entry in entries {
            self.push(entry);
        }
    }

    /// Whether priority ordering is active.
    #[must_use]
    pub const fn priority_ordering(&self) -> bool {
        self.by_priority
    }

    /// Current depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, priority: Priority) -> QueueEntry {
        QueueEntry {
            task_id: TaskId::new(),
            priority,
            seq,
        }
    }

    #[test]
    fn test_priority_ordering() {
        let mut q = PendingQueue::new(true);
        let low = entry(1, Priority::Low);
        let critical = entry(2, Priority::Critical);
        let medium = entry(3, Priority::Medium);
        let high = entry(4, Priority::High);
        for e in [low, critical, medium, high] {
            q.push(e);
        }

        assert_eq!(q.pop(), Some(critical));
        assert_eq!(q.pop(), Some(high));
        assert_eq!(q.pop(), Some(medium));
        assert_eq!(q.pop(), Some(low));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = PendingQueue::new(true);
        let third = entry(30, Priority::Medium);
        let first = entry(10, Priority::Medium);
        let second = entry(20, Priority::Medium);
        for e in [third, first, second] {
            q.push(e);
        }

        assert_eq!(q.pop(), Some(first));
        assert_eq!(q.pop(), Some(second));
        assert_eq!(q.pop(), Some(third));
    }

    #[test]
    fn test_fifo_when_priority_disabled() {
        let mut q = PendingQueue::new(false);
        let low = entry(1, Priority::Low);
        let critical = entry(2, Priority::Critical);
        q.push(critical);
        q.push(low);

        assert_eq!(q.pop(), Some(low));
        assert_eq!(q.pop(), Some(critical));
    }

    #[test]
    fn test_toggle_reorders_existing_entries() {
        let mut q = PendingQueue::new(false);
        let low = entry(1, Priority::Low);
        let high = entry(2, Priority::High);
        q.push(low);
        q.push(high);
        assert_eq!(q.ordered()[0], low);

        q.set_priority_ordering(true);
        assert_eq!(q.ordered(), vec![high, low]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut q = PendingQueue::new(true);
        let a = entry(1, Priority::Medium);
        let b = entry(2, Priority::High);
        q.push(a);
        q.push(b);

        assert!(q.remove(&a.task_id));
        assert!(!q.remove(&a.task_id));
        assert!(!q.contains(&a.task_id));
        assert_eq!(q.len(), 1);

        let cleared = q.clear();
        assert_eq!(cleared, vec![b]);
        assert!(q.is_empty());
    }
}
