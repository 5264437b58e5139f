//! Bounded handoff queue between concurrent units
//!
//! Producers never wait. When the queue is full the oldest evictable item is
//! dropped (audio), and if nothing is evictable the push fails (control).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::{Error, Result};

/// Bounded multi-producer queue with a drop-oldest overflow policy
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push, evicting the oldest item when full
    ///
    /// Returns the evicted item, if any.
    pub fn push_lossy(&self, item: T) -> Option<T> {
        self.push_evicting(item, |_| true).unwrap_or(None)
    }

    /// Push, evicting the oldest item matching `evictable` when full
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueFull` if the queue is full and nothing is evictable
    pub fn push_evicting(&self, item: T, evictable: impl Fn(&T) -> bool) -> Result<Option<T>> {
        let evicted = {
            let mut items = self.lock();

            let evicted = if items.len() >= self.capacity {
                let Some(pos) = items.iter().position(&evictable) else {
                    return Err(Error::QueueFull(self.name));
                };
                self.dropped.fetch_add(1, Ordering::Relaxed);
                items.remove(pos)
            } else {
                None
            };

            items.push_back(item);
            evicted
        };

        if evicted.is_some() {
            tracing::trace!(queue = self.name, "queue full, dropped oldest item");
        }
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait for the next item; `None` once closed and empty
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Close the queue; waiting consumers drain what is left then get `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items dropped by overflow since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
