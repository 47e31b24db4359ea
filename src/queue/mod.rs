//! Bounded per-destination queues and their senders
//!
//! ```text
//! dispatcher ──push──► BoundedQueue ──pop_batch──► sender ──spawn──► PushEndpoint
//!                      (drop-oldest)                 │ semaphore(max_concurrency)
//!                                                    └ retry max_retries, fixed backoff
//! ```
//!
//! The dispatcher never waits on a queue: overflow is expressed as a drop
//! counter, not as latency.

mod registry;
mod sender;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Deserialize;

use crate::clock::Clock;
use crate::stats::Counter;

pub use registry::{Destination, EndpointFactory, QueueRegistry};
pub use sender::{SenderConfig, WarnLimiter};

pub const DEFAULT_CAPACITY: usize = 1_024_000;

/// What happens to a push that finds the queue full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest item and admit the new one
    #[default]
    DropOldest,
    /// Refuse the new item
    Reject,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Lock-free bounded FIFO with drop accounting
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
    policy: OverflowPolicy,
    admitted: AtomicU64,
    dropped: AtomicU64,
    /// Unix seconds of the last push or pop
    last_activity: AtomicI64,
    drop_counter: Counter,
    clock: Clock,
}

impl<T> BoundedQueue<T> {
    /// `drop_counter` is the process-wide counter bumped on every drop
    pub fn new(config: QueueConfig, drop_counter: Counter, clock: Clock) -> Self {
        Self {
            inner: ArrayQueue::new(config.capacity.max(1)),
            policy: config.overflow,
            admitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_activity: AtomicI64::new(clock.now()),
            drop_counter,
            clock,
        }
    }

    /// Enqueue `item`; returns whether it was admitted
    pub fn push(&self, item: T) -> bool {
        self.touch();
        match self.policy {
            OverflowPolicy::DropOldest => {
                if self.inner.force_push(item).is_some() {
                    self.record_drop();
                }
                self.admitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            OverflowPolicy::Reject => match self.inner.push(item) {
                Ok(()) => {
                    self.admitted.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.record_drop();
                    false
                }
            },
        }
    }

    /// Pop up to `max` items in FIFO order
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        while batch.len() < max {
            match self.inner.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        if !batch.is_empty() {
            self.touch();
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(self.clock.now(), Ordering::Relaxed);
    }

    /// Empty the queue, counting every discarded item as a drop
    pub fn discard(&self) -> usize {
        let mut discarded = 0;
        while self.inner.pop().is_some() {
            self.record_drop();
            discarded += 1;
        }
        discarded
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.drop_counter.incr();
    }
}
