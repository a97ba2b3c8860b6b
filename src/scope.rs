//! LIFO finalizer stack with idempotent close.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt as _;
use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::Defect;

type Finalizer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Inner {
    finalizers: Vec<Finalizer>,
    closed: bool,
}

/// A stack of cleanup actions run in reverse registration order when the
/// scope closes.
///
/// Registering a finalizer after the scope has already closed runs it
/// immediately instead of queuing it — there is no "too late" state, only
/// "closed". A finalizer that panics or whose future the caller chooses to
/// treat as failing does not prevent the remaining finalizers from running;
/// [`Effect::ensuring`](crate::effect::Effect::ensuring) is what most code
/// should reach for, but a bare `Scope` is exposed for `Layer::build_scoped`
/// and other lifetime-extension use cases.
///
/// ```
/// # use effect_rail::scope::Scope;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let order = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
/// let scope = Scope::new();
///
/// for i in 0..3 {
///     let order = order.clone();
///     scope.add_finalizer(move || {
///         Box::pin(async move { order.lock().await.push(i) })
///     }).await;
/// }
/// scope.close().await;
/// assert_eq!(*order.lock().await, vec![2, 1, 0]);
/// # }
/// ```
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A fresh, open scope with no registered finalizers.
    pub fn new() -> Self {
        Scope {
            inner: Arc::new(Mutex::new(Inner {
                finalizers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Registers `fin` to run when the scope closes, or runs it immediately
    /// if the scope is already closed.
    pub async fn add_finalizer<F, Fut>(&self, fin: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Finalizer = Box::new(move || Box::pin(fin()));
        let mut guard = self.inner.lock().await;
        if guard.closed {
            drop(guard);
            boxed().await;
        } else {
            guard.finalizers.push(boxed);
        }
    }

    /// Drains and runs every registered finalizer in LIFO order.
    ///
    /// Idempotent: a second call is a no-op. Each finalizer is awaited to
    /// completion before the next starts (matching the source's
    /// sequential, unwind-style drain) so ordering is exact even though the
    /// finalizers themselves run concurrently with nothing else. A
    /// finalizer that panics mid-poll is caught and swallowed — the panic
    /// never escapes the drain loop, so every remaining finalizer still
    /// runs — matching the source's `try: ... except Exception: pass`
    /// around each call.
    pub async fn close(&self) {
        self.close_inner(None).await;
    }

    /// Like [`close`](Self::close), but logs a panicking finalizer's
    /// payload through `ctx`'s [`Logger`](crate::services::logger::Logger)
    /// if one is bound, the same way
    /// [`ensuring`](crate::effect::Effect::ensuring) and
    /// [`acquire_release`](crate::effect::acquire_release) log their
    /// swallowed release failures.
    pub async fn close_with_context(&self, ctx: &Context) {
        self.close_inner(Some(ctx)).await;
    }

    async fn close_inner(&self, ctx: Option<&Context>) {
        let mut finalizers = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return;
            }
            guard.closed = true;
            std::mem::take(&mut guard.finalizers)
        };
        while let Some(fin) = finalizers.pop() {
            if let Err(payload) = AssertUnwindSafe(fin()).catch_unwind().await {
                if let Some(ctx) = ctx {
                    let rendered = Defect::from_panic(payload).to_string();
                    crate::services::logger::log_swallowed(ctx, "scope finalizer", &rendered).await;
                }
            }
        }
    }

    /// True once [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn finalizers_run_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..3 {
            let log = log.clone();
            scope
                .add_finalizer(move || async move { log.lock().await.push(i) })
                .await;
        }
        scope.close().await;
        assert_eq!(*log.lock().await, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let c = count.clone();
        scope
            .add_finalizer(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        scope.close().await;
        scope.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_finalizer_does_not_block_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..3 {
            let log = log.clone();
            scope
                .add_finalizer(move || async move {
                    if i == 1 {
                        panic!("finalizer {i} blew up");
                    }
                    log.lock().await.push(i);
                })
                .await;
        }
        scope.close().await;
        assert_eq!(*log.lock().await, vec![2, 0]);
    }

    #[tokio::test]
    async fn late_registration_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        scope.close().await;
        let c = count.clone();
        scope
            .add_finalizer(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
