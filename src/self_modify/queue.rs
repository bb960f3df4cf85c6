//! # Stage: Improvement Queue
//!
//! ## Responsibility
//! Priority-ordered holding area for discovered candidates awaiting a worker
//! slot. The queue knows nothing about the domain: the caller chooses the
//! priority (see [`Origin::priority`](crate::improvement::Origin::priority)).
//!
//! ## Guarantees
//! - Highest priority first; equal priorities leave in insertion order.
//! - `O(log n)` enqueue and dequeue (binary heap keyed on priority plus a
//!   monotonically increasing sequence number).
//! - Unbounded. Callers watch [`ImprovementQueue::len`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::improvement::Improvement;

#[derive(Debug)]
struct Entry {
    priority: f64,
    seq: u64,
    improvement: Improvement,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: larger priority wins; on ties the earlier seq wins.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of pending improvements.
#[derive(Debug, Default)]
pub struct ImprovementQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ImprovementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `improvement` with the caller-chosen `priority`.
    ///
    /// NaN priorities sort below every real priority.
    pub fn enqueue(&mut self, improvement: Improvement, priority: f64) {
        let priority = if priority.is_nan() { f64::NEG_INFINITY } else { priority };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { priority, seq, improvement });
    }

    /// Remove and return the highest-priority improvement.
    pub fn dequeue(&mut self) -> Option<Improvement> {
        self.heap.pop().map(|e| e.improvement)
    }

    /// Remove up to `n` improvements in priority order.
    pub fn drain_batch(&mut self, n: usize) -> Vec<Improvement> {
        let mut batch = Vec::with_capacity(n.min(self.heap.len()));
        while batch.len() < n {
            match self.dequeue() {
                Some(imp) => batch.push(imp),
                None => break,
            }
        }
        batch
    }

    /// Priority of the next improvement to leave, if any.
    pub fn peek_priority(&self) -> Option<f64> {
        self.heap.peek().map(|e| e.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::Category;
    use proptest::prelude::*;

    fn imp(label: &str) -> Improvement {
        Improvement::new(Category::Ensemble, label, 0.9, 0.1, 0.1).with_id(label)
    }

    #[test]
    fn empty_queue() {
        let mut q = ImprovementQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert!(q.dequeue().is_none());
        assert!(q.peek_priority().is_none());
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let mut q = ImprovementQueue::new();
        q.enqueue(imp("five"), 5.0);
        q.enqueue(imp("twenty"), 20.0);
        q.enqueue(imp("ten"), 10.0);
        let order: Vec<String> = std::iter::from_fn(|| q.dequeue()).map(|i| i.id().to_string()).collect();
        assert_eq!(order, vec!["twenty", "ten", "five"]);
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let mut q = ImprovementQueue::new();
        q.enqueue(imp("first"), 1.0);
        q.enqueue(imp("second"), 1.0);
        q.enqueue(imp("third"), 1.0);
        assert_eq!(q.dequeue().unwrap().id(), "first");
        assert_eq!(q.dequeue().unwrap().id(), "second");
        assert_eq!(q.dequeue().unwrap().id(), "third");
    }

    #[test]
    fn urgent_preempts_routine() {
        let mut q = ImprovementQueue::new();
        let routine = imp("routine");
        let urgent = imp("urgent");
        q.enqueue(routine, 0.1);
        q.enqueue(urgent, crate::improvement::Origin::Urgent.priority(0.06));
        assert_eq!(q.dequeue().unwrap().id(), "urgent");
    }

    #[test]
    fn nan_priority_sorts_last() {
        let mut q = ImprovementQueue::new();
        q.enqueue(imp("nan"), f64::NAN);
        q.enqueue(imp("negative"), -100.0);
        assert_eq!(q.dequeue().unwrap().id(), "negative");
        assert_eq!(q.dequeue().unwrap().id(), "nan");
    }

    #[test]
    fn drain_batch_takes_at_most_n() {
        let mut q = ImprovementQueue::new();
        for i in 0..5 {
            q.enqueue(imp(&format!("i{i}")), i as f64);
        }
        let batch = q.drain_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].id(), "i4");
        assert_eq!(q.len(), 2);
        assert_eq!(q.drain_batch(10).len(), 2);
        assert!(q.is_empty());
    }

    proptest! {
        #[test]
        fn dequeue_order_is_stable_descending(prios in proptest::collection::vec(-5i32..5, 0..40)) {
            let mut q = ImprovementQueue::new();
            for (i, p) in prios.iter().enumerate() {
                q.enqueue(imp(&i.to_string()), *p as f64);
            }
            let mut expected: Vec<(i32, usize)> = prios.iter().copied().zip(0..).collect();
            // Descending priority, ascending insertion index on ties.
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            let got: Vec<String> = std::iter::from_fn(|| q.dequeue()).map(|i| i.id().to_string()).collect();
            let want: Vec<String> = expected.iter().map(|(_, i)| i.to_string()).collect();
            prop_assert_eq!(got, want);
        }
    }
}
