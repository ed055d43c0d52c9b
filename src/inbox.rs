//! Per-task message inboxes.
//!
//! Each registered task owns one [`Inbox`]: a strict-FIFO queue of opaque
//! messages. `send` never blocks (a bounded inbox at capacity fails fast);
//! `receive` waits up to a caller-supplied timeout. The lock/notify pair
//! gives a happens-before edge from each send to its matched receive.

use crossbeam_queue::SegQueue;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};

/// An opaque inter-task message. Receivers downcast to the concrete type.
pub type Message = Box<dyn Any + Send>;

/// A FIFO inbox with optional bounded capacity and timed receive.
pub struct Inbox<T> {
    queue: SegQueue<T>,
    /// 0 = unbounded.
    capacity: usize,
    closed: AtomicBool,
    mutex: Mutex<()>,
    available: Condvar,
}

impl<T> Inbox<T> {
    /// Creates an inbox. `capacity` of 0 means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            capacity,
            closed: AtomicBool::new(false),
            mutex: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Number of messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues a message.
    ///
    /// Never blocks. Fails with `InboxFull` when a bounded inbox is at
    /// capacity, or `Shutdown` when the inbox has been closed.
    pub fn send(&self, msg: T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Shutdown).with_context("inbox closed"));
        }
        if self.capacity > 0 {
            // The capacity check and push happen under the lock so two
            // senders cannot both observe one free slot.
            let _guard = self.mutex.lock().expect("inbox lock poisoned");
            if self.queue.len() >= self.capacity {
                return Err(Error::new(ErrorKind::InboxFull));
            }
            self.queue.push(msg);
            self.available.notify_one();
        } else {
            self.queue.push(msg);
            let _guard = self.mutex.lock().expect("inbox lock poisoned");
            self.available.notify_one();
        }
        Ok(())
    }

    /// Dequeues the next message, waiting up to `timeout`.
    ///
    /// A zero timeout is a non-blocking poll. Fails with `Timeout` on
    /// expiry or `Shutdown` if the inbox closes while waiting.
    pub fn receive(&self, timeout: Duration) -> Result<T> {
        if let Some(msg) = self.queue.pop() {
            return Ok(msg);
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock().expect("inbox lock poisoned");
        loop {
            // Re-check under the lock: a sender must hold it to notify, so a
            // message pushed before we wait cannot be missed.
            if let Some(msg) = self.queue.pop() {
                return Ok(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::new(ErrorKind::Shutdown).with_context("inbox closed"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::new(ErrorKind::Timeout));
            }
            let (g, _timed_out) = self
                .available
                .wait_timeout(guard, remaining)
                .expect("inbox lock poisoned");
            guard = g;
        }
    }

    /// Closes the inbox and wakes all blocked receivers.
    ///
    /// Queued messages remain receivable; further sends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.mutex.lock().expect("inbox lock poisoned");
        self.available.notify_all();
    }
}

impl<T> std::fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("len", &self.queue.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
