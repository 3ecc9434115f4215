use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::job::Job;

/// A unit of ready work held in memory between poll and dispatch.
///
/// Its durable counterpart is the `pending` job run row `run_id`.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Shared handle to the registered job; the registry stays the owner.
    pub job: Arc<dyn Job>,
    pub run_id: i64,
    /// Lower value = dequeued first.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Heap slot. `seq` is a monotonically increasing insertion counter used as
/// the final tie-break so equal-priority items leave in arrival order even
/// when their timestamps collide.
#[derive(Debug)]
struct Slot {
    seq: u64,
    item: QueueItem,
}

impl Slot {
    fn key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.item.priority, self.item.enqueued_at, self.seq)
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    // BinaryHeap is a max-heap: reverse so the smallest key sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// In-memory ordered buffer for one named queue.
///
/// `dequeue` returns the lowest `priority`; ties go to the earliest
/// `enqueued_at`, then to the earliest insertion. Not thread-safe on its own:
/// the engine wraps each queue in a mutex and is its only user.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Slot>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: QueueItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Slot { seq, item });
    }

    pub fn dequeue(&mut self) -> Option<QueueItem> {
        self.heap.pop().map(|slot| slot.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every held item, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.heap.len();
        self.heap.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobResult, RunContext};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _ctx: &RunContext) -> JobResult {
            JobResult::empty()
        }
    }

    fn item(run_id: i64, priority: i32, at: DateTime<Utc>) -> QueueItem {
        QueueItem {
            job: Arc::new(Noop),
            run_id,
            priority,
            enqueued_at: at,
        }
    }

    fn drain(q: &mut PriorityQueue) -> Vec<QueueItem> {
        std::iter::from_fn(|| q.dequeue()).collect()
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let mut q = PriorityQueue::new();
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn dequeues_in_non_decreasing_priority() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let priorities = [7, 3, 9, 0, 3, 5, 10, 1, 7, 2];
        let mut q = PriorityQueue::new();
        for (i, p) in priorities.iter().enumerate() {
            q.enqueue(item(i as i64, *p, t0 + chrono::Duration::milliseconds(i as i64)));
        }
        assert_eq!(q.len(), priorities.len());

        let out: Vec<i32> = drain(&mut q).iter().map(|i| i.priority).collect();
        let mut sorted = priorities.to_vec();
        sorted.sort();
        assert_eq!(out, sorted);
    }

    #[test]
    fn equal_priority_is_fifo_even_with_identical_timestamps() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let mut q = PriorityQueue::new();
        // Interleave a higher-priority item to disturb the heap layout.
        for run_id in 1..=6 {
            q.enqueue(item(run_id, 4, t0));
            if run_id == 3 {
                q.enqueue(item(100, 1, t0));
            }
        }

        let ids: Vec<i64> = drain(&mut q).iter().map(|i| i.run_id).collect();
        assert_eq!(ids, vec![100, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn earlier_enqueue_time_wins_over_insertion_order() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let mut q = PriorityQueue::new();
        // Re-queued item keeps its original timestamp and goes back to the front.
        q.enqueue(item(2, 5, t0 + chrono::Duration::seconds(1)));
        q.enqueue(item(1, 5, t0));
        assert_eq!(q.dequeue().map(|i| i.run_id), Some(1));
        assert_eq!(q.dequeue().map(|i| i.run_id), Some(2));
    }

    #[test]
    fn clear_reports_discarded() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let mut q = PriorityQueue::new();
        q.enqueue(item(1, 1, t0));
        q.enqueue(item(2, 2, t0));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
