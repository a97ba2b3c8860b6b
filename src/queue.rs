//! Bounded FIFO with a closed state.
//!
//! Capacity `0` means unbounded: `send` never blocks on space. Once closed,
//! sends fail immediately; receives continue to drain whatever is already
//! buffered, only failing once both closed and empty.

use std::collections::VecDeque;

use tokio::sync::Notify;

use crate::error::RuntimeError;

struct Inner<T> {
    buf: std::sync::Mutex<VecDeque<T>>,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
    not_full: Notify,
    not_empty: Notify,
}

/// A bounded (or, with `capacity == 0`, unbounded) first-in-first-out queue.
///
/// FIFO order is preserved per-producer; when multiple producers send
/// concurrently, the interleaving across producers is unspecified.
pub struct Queue<T> {
    inner: std::sync::Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Queue<T> {
    /// A fresh, open queue. `capacity == 0` is unbounded.
    pub fn new(capacity: usize) -> Self {
        Queue {
            inner: std::sync::Arc::new(Inner {
                buf: std::sync::Mutex::new(VecDeque::new()),
                capacity,
                closed: std::sync::atomic::AtomicBool::new(false),
                not_full: Notify::new(),
                not_empty: Notify::new(),
            }),
        }
    }

    /// An unbounded queue.
    pub fn unbounded() -> Self {
        Queue::new(0)
    }

    /// The number of items currently buffered.
    pub fn size(&self) -> usize {
        self.inner.buf.lock().expect("queue mutex poisoned").len()
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Closes the queue: wakes every waiting sender and receiver. Idempotent.
    /// Subsequent sends fail with [`RuntimeError::SendOnClosed`]; receives
    /// continue to drain buffered items, then fail with
    /// [`RuntimeError::ReceiveOnClosed`].
    pub fn close(&self) {
        self.inner.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.not_full.notify_waiters();
        self.inner.not_empty.notify_waiters();
    }

    /// Enqueues `item`, waiting for free capacity if the queue is bounded
    /// and full.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SendOnClosed`] if the queue was already closed.
    pub async fn send(&self, item: T) -> Result<(), RuntimeError> {
        loop {
            // Registered before the condition check so a `close`/`receive`
            // that runs concurrently can never notify into a gap where
            // nothing is listening yet.
            let not_full = self.inner.not_full.notified();
            tokio::pin!(not_full);
            not_full.as_mut().enable();
            if self.is_closed() {
                return Err(RuntimeError::SendOnClosed);
            }
            {
                let mut buf = self.inner.buf.lock().expect("queue mutex poisoned");
                if self.inner.capacity == 0 || buf.len() < self.inner.capacity {
                    buf.push_back(item);
                    drop(buf);
                    self.inner.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            not_full.await;
        }
    }

    /// Dequeues the next item in FIFO order, waiting if the queue is empty
    /// and open.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ReceiveOnClosed`] once the queue is both closed and
    /// drained.
    pub async fn receive(&self) -> Result<T, RuntimeError> {
        loop {
            let not_empty = self.inner.not_empty.notified();
            tokio::pin!(not_empty);
            not_empty.as_mut().enable();
            {
                let mut buf = self.inner.buf.lock().expect("queue mutex poisoned");
                if let Some(item) = buf.pop_front() {
                    drop(buf);
                    self.inner.not_full.notify_waiters();
                    return Ok(item);
                }
                if self.is_closed() {
                    return Err(RuntimeError::ReceiveOnClosed);
                }
            }
            not_empty.await;
        }
    }
}
