//! Unbounded or small-bounded rendezvous primitive used by pipeline stages.
//!
//! A `Channel<T>` is [`Queue`](crate::queue::Queue) with a narrower API:
//! `send`/`receive`/`close`/`size`, nothing else. Pipeline stages reach for
//! this instead of a full `Queue` when they don't need the richer surface.

use crate::error::RuntimeError;
use crate::queue::Queue;

/// A simple send/receive rendezvous channel. `capacity == 0` is unbounded.
#[derive(Clone)]
pub struct Channel<T> {
    queue: Queue<T>,
}

impl<T: Send> Channel<T> {
    /// A fresh, open channel. `capacity == 0` is unbounded.
    pub fn new(capacity: usize) -> Self {
        Channel {
            queue: Queue::new(capacity),
        }
    }

    /// An unbounded channel.
    pub fn unbounded() -> Self {
        Channel::new(0)
    }

    /// Sends `item`, waiting for capacity if bounded and full.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SendOnClosed`] if already closed.
    pub async fn send(&self, item: T) -> Result<(), RuntimeError> {
        self.queue.send(item).await
    }

    /// Receives the next item, waiting if empty and open.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ReceiveOnClosed`] once closed and drained.
    pub async fn receive(&self) -> Result<T, RuntimeError> {
        self.queue.receive().await
    }

    /// Closes the channel; see [`Queue::close`].
    pub fn close(&self) {
        self.queue.close();
    }

    /// The number of items currently buffered.
    pub fn size(&self) -> usize {
        self.queue.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_receive_roundtrips() {
        let c: Channel<i32> = Channel::unbounded();
        c.send(9).await.unwrap();
        assert_eq!(c.receive().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn send_on_closed_channel_fails() {
        let c: Channel<i32> = Channel::unbounded();
        c.close();
        assert!(c.send(1).await.is_err());
    }
}
