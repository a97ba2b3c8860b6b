//! Multi-subscriber broadcast built from per-subscriber [`Queue`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;
use crate::queue::Queue;

struct Inner<T> {
    subs: Mutex<HashMap<u64, Queue<T>>>,
    closed: std::sync::atomic::AtomicBool,
}

/// A publisher that fans out each published item to every current
/// subscriber's own [`Queue`].
///
/// `publish` snapshots the subscriber set under a lock, then sends to each
/// subscriber's queue outside the lock — one slow subscriber's backpressure
/// blocks that `publish` call but never blocks a concurrent `subscribe`
/// from seeing the lock.
pub struct Hub<T> {
    inner: Arc<Inner<T>>,
    next_id: AtomicU64,
}

impl<T> Default for Hub<T> {
    fn default() -> Self {
        Hub::new()
    }
}

impl<T: Clone + Send> Hub<T> {
    /// A fresh hub with no subscribers.
    pub fn new() -> Self {
        Hub {
            inner: Arc::new(Inner {
                subs: Mutex::new(HashMap::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber with its own queue of the given capacity
    /// (`0` = unbounded).
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SubscribeOnClosed`] if the hub is already closed.
    pub fn subscribe(&self, capacity: usize) -> Result<Subscription<T>, RuntimeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::SubscribeOnClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let q = Queue::new(capacity);
        self.inner.subs.lock().expect("hub mutex poisoned").insert(id, q.clone());
        Ok(Subscription {
            hub: self.inner.clone(),
            id,
            queue: q,
        })
    }

    /// Delivers `item` to the snapshot of subscribers taken at the moment of
    /// this call.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SendOnClosed`] if the hub is already closed (a
    /// subscriber's own queue being closed independently is not an error
    /// here — that subscriber simply stops receiving).
    pub async fn publish(&self, item: T) -> Result<(), RuntimeError>
    where
        T: Clone,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::SendOnClosed);
        }
        let subs: Vec<Queue<T>> = self
            .inner
            .subs
            .lock()
            .expect("hub mutex poisoned")
            .values()
            .cloned()
            .collect();
        for q in subs {
            let _ = q.send(item.clone()).await;
        }
        Ok(())
    }

    /// Closes the hub and every current subscriber's queue; refuses further
    /// subscriptions.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let subs = std::mem::take(&mut *self.inner.subs.lock().expect("hub mutex poisoned"));
        for (_, q) in subs {
            q.close();
        }
    }
}

/// A single subscriber's handle onto a [`Hub`].
pub struct Subscription<T> {
    hub: Arc<Inner<T>>,
    id: u64,
    queue: Queue<T>,
}

impl<T: Send> Subscription<T> {
    /// Receives the next item published since this subscription was
    /// created (or since the last `receive`).
    pub async fn receive(&self) -> Result<T, RuntimeError> {
        self.queue.receive().await
    }

    /// The number of items currently buffered for this subscriber.
    pub fn size(&self) -> usize {
        self.queue.size()
    }

    /// Unsubscribes, closing only this subscriber's queue.
    pub fn close(&self) {
        self.hub.subs.lock().expect("hub mutex poisoned").remove(&self.id);
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let hub: Hub<i32> = Hub::new();
        let s1 = hub.subscribe(0).unwrap();
        let s2 = hub.subscribe(0).unwrap();
        hub.publish(7).await.unwrap();
        assert_eq!(s1.receive().await.unwrap(), 7);
        assert_eq!(s2.receive().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unsubscribe_only_closes_that_subscriber() {
        let hub: Hub<i32> = Hub::new();
        let s1 = hub.subscribe(0).unwrap();
        let s2 = hub.subscribe(0).unwrap();
        s1.close();
        hub.publish(1).await.unwrap();
        assert_eq!(s2.receive().await.unwrap(), 1);
        assert!(s1.receive().await.is_err());
    }

    #[tokio::test]
    async fn close_closes_all_subscriber_queues() {
        let hub: Hub<i32> = Hub::new();
        let s1 = hub.subscribe(0).unwrap();
        hub.close();
        assert!(s1.receive().await.is_err());
        assert!(hub.subscribe(0).is_err());
    }
}
