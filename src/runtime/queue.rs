//! Mutex + condition variable FIFO shared by the service loops.
//!
//! Each queue has a single producer and a single consumer. Waits use the
//! loop-with-predicate form, and `shutdown()` wakes every waiter so blocked
//! consumers can observe the stop request within their bounded timeouts.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// An ordered queue with condition signaling and bounded-overflow support.
pub struct SignalQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> Default for SignalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignalQueue<T> {
    pub fn new() -> Self {
        SignalQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item and wakes one waiter.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        inner.items.push_back(item);
        drop(inner);
        self.cond.notify_one();
    }

    /// Appends an item, then drops oldest entries until the length is within
    /// `bound`. Returns the number of dropped entries so the producer can log
    /// the overflow; the newest item always survives.
    pub fn push_bounded(&self, item: T, bound: usize) -> usize {
        let mut inner = self.lock();
        inner.items.push_back(item);
        let mut dropped = 0;
        while inner.items.len() > bound {
            inner.items.pop_front();
            dropped += 1;
        }
        drop(inner);
        self.cond.notify_one();
        dropped
    }

    /// Blocks until an item is available or the queue is shut down.
    /// Returns `None` only on shutdown.
    pub fn pop_wait(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.shutdown {
                return None;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits up to `timeout` for an item. Returns `None` on timeout or
    /// shutdown; callers distinguish the two via their own run flag.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.shutdown {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Removes an item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Discards all queued items and returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.items.len();
        inner.items.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Marks the queue shut down and wakes all waiters. Pending items remain
    /// poppable; blocked waits return `None`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }
}
