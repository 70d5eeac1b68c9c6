//! Bounded concurrent queue used to move frames and results between threads.
//!
//! `push` never blocks the producer and never allocates beyond the fixed
//! capacity; `try_pop` returns immediately. The overflow policy is a
//! construction-time choice: the capture path evicts the oldest frame because
//! a stale frame is worse than a dropped one for a live system, while control
//! and result channels reject the newest item so nothing already queued is
//! silently lost.
//!
//! The same implementation serves the single-producer capture usage and the
//! multi-producer control usage; correctness does not depend on
//! producer/consumer multiplicity.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// What to do when a push finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the incoming item, preserving everything already queued.
    RejectNewest,
    /// Drop the oldest queued item to admit the incoming one, bounding
    /// staleness. Never reorders the surviving items.
    EvictOldest,
}

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item admitted without displacing anything.
    Pushed,
    /// Item admitted; the oldest queued item was evicted to make room.
    Evicted,
    /// Item refused; the queue is unchanged.
    Rejected,
}

/// Fixed-capacity concurrent FIFO queue.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue with the given fixed capacity and overflow policy.
    ///
    /// Capacity must be at least 1.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an item without blocking. Overflow handling follows the queue's
    /// policy; the dropped counter records every displaced or refused item.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut q = self.inner.lock();

        if q.len() < self.capacity {
            q.push_back(item);
            self.pushed.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Pushed;
        }

        match self.policy {
            OverflowPolicy::RejectNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Rejected
            }
            OverflowPolicy::EvictOldest => {
                q.pop_front();
                q.push_back(item);
                self.pushed.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Evicted
            }
        }
    }

    /// Pop the oldest item, or `None` if the queue is empty. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.inner.lock().pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Drain everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.inner.lock().drain(..).collect();
        self.popped.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total items admitted (including those that later got evicted).
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total items consumed via `try_pop` or `drain`.
    pub fn total_popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    /// Total items lost to the overflow policy (evicted or rejected).
    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo_order() {
        let q = BoundedQueue::new(4, OverflowPolicy::RejectNewest);
        for i in 0..4 {
            assert_eq!(q.push(i), PushOutcome::Pushed);
        }
        for i in 0..4 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_reject_newest_keeps_queued_items() {
        let q = BoundedQueue::new(2, OverflowPolicy::RejectNewest);
        q.push(1);
        q.push(2);
        assert_eq!(q.push(3), PushOutcome::Rejected);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.total_dropped(), 1);
    }

    #[test]
    fn test_evict_oldest_bounds_staleness() {
        let q = BoundedQueue::new(2, OverflowPolicy::EvictOldest);
        q.push(1);
        q.push(2);
        assert_eq!(q.push(3), PushOutcome::Evicted);
        // Oldest gone, order of survivors preserved
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.total_dropped(), 1);
    }

    #[test]
    fn test_no_drops_within_capacity() {
        let q = BoundedQueue::new(8, OverflowPolicy::EvictOldest);
        for i in 0..8 {
            q.push(i);
        }
        assert_eq!(q.total_dropped(), 0);
    }

    #[test]
    fn test_drain_returns_oldest_first() {
        let q = BoundedQueue::new(4, OverflowPolicy::EvictOldest);
        q.push(10);
        q.push(20);
        q.push(30);
        assert_eq!(q.drain(), vec![10, 20, 30]);
        assert!(q.is_empty());
        assert_eq!(q.total_popped(), 3);
    }

    /// N producers and M consumers running at the same time: every popped
    /// item was actually pushed, and nothing is consumed twice. With capacity
    /// large enough that overflow never triggers, nothing is dropped either.
    #[test]
    fn test_concurrent_stress_conservation() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: u64 = 1000;

        let q = Arc::new(BoundedQueue::new(
            (PRODUCERS as u64 * PER_PRODUCER) as usize,
            OverflowPolicy::EvictOldest,
        ));
        let producers_done = Arc::new(AtomicBool::new(false));

        // Consumers drain while producers are still pushing; they only exit
        // once all producers finished and the queue is observed empty.
        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let q = q.clone();
            let done = producers_done.clone();
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    if let Some(v) = q.try_pop() {
                        seen.push(v);
                        continue;
                    }
                    if done.load(Ordering::SeqCst) && q.is_empty() {
                        break;
                    }
                    thread::yield_now();
                }
                seen
            }));
        }

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p as u64 * PER_PRODUCER + i);
                }
            }));
        }
        for h in producers {
            h.join().unwrap();
        }
        producers_done.store(true, Ordering::SeqCst);

        let mut all: Vec<u64> = Vec::new();
        for h in consumers {
            all.extend(h.join().unwrap());
        }

        // Exactly once each: no loss (capacity was never exceeded), no
        // duplication, no fabrication.
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER as usize);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER as usize);
        assert!(all.iter().all(|&v| v < PRODUCERS as u64 * PER_PRODUCER));
        assert_eq!(q.total_dropped(), 0);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn test_zero_capacity_rejected() {
        let _ = BoundedQueue::<u32>::new(0, OverflowPolicy::RejectNewest);
    }
}
