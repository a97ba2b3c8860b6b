//! Abstracts the async reactor `Runtime` drives fibers through, so the
//! runtime's own plumbing — not an individual [`Effect`](crate::effect::Effect)'s
//! sleeps, which stay on `tokio::time` directly for cancellability — can be
//! swapped out.
//!
//! Grounded in spec.md §9's "Backends: abstract the reactor behind a small
//! trait" note. [`TokioBackend`] is the only implementation shipped; the
//! trait exists so an embedder could substitute a different task spawner
//! (a thread-pool executor, a single-threaded test harness) without
//! touching `Runtime`'s public API.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The reactor operations a [`Runtime`](crate::fiber::Runtime) needs: fire
/// a detached task, suspend for a duration, and yield to the scheduler.
/// Object-safe so a `Runtime` can hold `Arc<dyn Backend>`.
pub trait Backend: Send + Sync {
    /// Spawns `fut` as a detached task, returning immediately.
    fn spawn(&self, fut: BoxFuture);
    /// A future that resolves after `d` elapses.
    fn sleep(&self, d: Duration) -> BoxFuture;
    /// A future that resolves after yielding once to the scheduler.
    fn yield_now(&self) -> BoxFuture;
}

/// The default [`Backend`], built directly on `tokio`'s own task spawner,
/// timer, and cooperative-yield primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioBackend;

impl Backend for TokioBackend {
    fn spawn(&self, fut: BoxFuture) {
        tokio::spawn(fut);
    }

    fn sleep(&self, d: Duration) -> BoxFuture {
        Box::pin(tokio::time::sleep(d))
    }

    fn yield_now(&self) -> BoxFuture {
        Box::pin(tokio::task::yield_now())
    }
}

/// The runtime's only configuration surface: no file- or env-based config
/// layer, matching spec.md's non-goal of a user-facing CLI and the
/// teacher's own lack of a config module.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Prefix auto-applied to a forked fiber's name when `fork` is called
    /// with `None`, as `"{prefix}-{id}"`. `None` leaves unnamed fibers
    /// unnamed.
    pub name_prefix: Option<String>,
    /// Default capacity new `Queue`s created by this runtime's own helpers
    /// should use when the caller doesn't specify one.
    pub default_queue_capacity: usize,
    /// Whether [`Runtime::bootstrap`](crate::fiber::Runtime::bootstrap)
    /// should bind a `ConsoleLogger` into the base `Context` before
    /// returning.
    pub install_default_logger: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            name_prefix: None,
            default_queue_capacity: 0,
            install_default_logger: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_backend_spawn_runs_the_future() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        TokioBackend.spawn(Box::pin(async move {
            r.store(true, Ordering::SeqCst);
        }));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tokio_backend_sleep_and_yield_resolve() {
        TokioBackend.sleep(Duration::from_millis(1)).await;
        TokioBackend.yield_now().await;
    }
}
