//! Bounded hand-off queue with an explicit overflow policy.
//!
//! Used between the capture callback and the frame loop, and between the
//! frame loop and the engine worker.  Producers never block: when the queue
//! is full the configured [`BackpressurePolicy`] decides which item is lost,
//! and the loss is counted so it can be reported.
//!
//! ```text
//! producer ──push──► [ item | item | item ] ──pop_timeout──► consumer
//!                       capacity N, drop-oldest or drop-newest
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Policy & outcome
// ---------------------------------------------------------------------------

/// Which item is discarded when a push finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued item to make room.
    DropOldest,
    /// Refuse the incoming item.
    DropNewest,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// Result of a single [`BoundedQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    DroppedOldest,
    /// The incoming item was discarded.
    DroppedNewest,
    /// The queue is closed; the item was discarded.
    Closed,
}

impl PushOutcome {
    /// `true` when some item was lost to backpressure.
    pub fn dropped(self) -> bool {
        matches!(self, Self::DroppedOldest | Self::DroppedNewest)
    }
}

// ---------------------------------------------------------------------------
// BoundedQueue
// ---------------------------------------------------------------------------

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl<T> BoundedQueue<T> {
    /// Create an open queue.  A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking, applying the overflow policy when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }
        let outcome = if inner.items.len() < self.capacity {
            inner.items.push_back(item);
            PushOutcome::Queued
        } else {
            inner.dropped += 1;
            match self.policy {
                BackpressurePolicy::DropOldest => {
                    inner.items.pop_front();
                    inner.items.push_back(item);
                    PushOutcome::DroppedOldest
                }
                BackpressurePolicy::DropNewest => PushOutcome::DroppedNewest,
            }
        };
        drop(inner);
        self.ready.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Wait up to `timeout` for an item.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and
    /// empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |inner| {
                inner.items.is_empty() && !inner.closed
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.items.pop_front()
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    /// Refuse further pushes and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Accept pushes again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Items lost to backpressure since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_within_capacity() {
        let q = BoundedQueue::new(4, BackpressurePolicy::DropOldest);
        assert_eq!(q.push(1), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Queued);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let q = BoundedQueue::new(2, BackpressurePolicy::DropOldest);
        q.push(1);
        q.push(2);
        let outcome = q.push(3);
        assert_eq!(outcome, PushOutcome::DroppedOldest);
        assert!(outcome.dropped());
        assert_eq!(q.drain(), vec![2, 3]);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn drop_newest_refuses_incoming() {
        let q = BoundedQueue::new(2, BackpressurePolicy::DropNewest);
        q.push(1);
        q.push(2);
        assert_eq!(q.push(3), PushOutcome::DroppedNewest);
        assert_eq!(q.drain(), vec![1, 2]);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn closed_queue_refuses_and_wakes_consumers() {
        let q = Arc::new(BoundedQueue::<u32>::new(2, BackpressurePolicy::DropOldest));
        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert_eq!(q.push(7), PushOutcome::Closed);

        q.reopen();
        assert_eq!(q.push(7), PushOutcome::Queued);
    }

    #[test]
    fn pop_timeout_returns_item_from_other_thread() {
        let q = Arc::new(BoundedQueue::new(2, BackpressurePolicy::DropOldest));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                q.push(42)
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn pop_timeout_expires_when_empty() {
        let q = BoundedQueue::<u8>::new(1, BackpressurePolicy::DropNewest);
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), None);
    }
}
