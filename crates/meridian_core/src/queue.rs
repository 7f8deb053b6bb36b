//! Bounded single-consumer queues with an explicit overflow policy.
//!
//! Used for per-connection outbound traffic and for fire-and-forget
//! propagation from workers. Delivery order within one queue is FIFO; what
//! happens when the queue is full is decided by [`OverflowPolicy`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// What a full queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room
    #[default]
    DropOldest,
    /// Wait until the consumer frees a slot
    Block,
}

/// Returned when pushing into a closed queue; hands the item back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed<T>(pub T);

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue. A zero capacity is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                dropped: 0,
            }),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Enqueues an item, applying the overflow policy when full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        loop {
            let writable = self.writable.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueClosed(item));
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(());
                }
                if self.policy == OverflowPolicy::DropOldest {
                    inner.items.pop_front();
                    inner.dropped += 1;
                    inner.items.push_back(item);
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Dequeues the next item; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.readable.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.writable.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Closes the queue. Queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items evicted by [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A poisoned lock still holds a consistent VecDeque.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
