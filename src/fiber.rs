//! Structured concurrency: fibers, the runtime that forks them, and the
//! cooperative interrupt signal suspension points consult.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backend::{Backend, RuntimeConfig, TokioBackend};
use crate::cause::{Cause, Exit};
use crate::context::Context;
use crate::error::Defect;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

fn next_fiber_id() -> u64 {
    NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-fiber cooperative cancellation state.
///
/// This is deliberately *not* a hard `JoinHandle::abort()`: the spec models
/// interruption as something observed at suspension points (sleeps, queue
/// operations, joins), the same way Python's `asyncio` only delivers
/// `CancelledError` at an `await`. A tokio task with no suspension point of
/// its own (a tight CPU loop) is simply not interruptible here either —
/// that limitation is inherent to cooperative cancellation, not a bug.
#[derive(Clone)]
pub(crate) struct FiberSignal {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
    mask_depth: Arc<AtomicU32>,
}

impl FiberSignal {
    pub(crate) fn new() -> Self {
        FiberSignal {
            requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            mask_depth: Arc::new(AtomicU32::new(0)),
        }
    }

    fn child(&self) -> Self {
        // A freshly forked fiber inherits nothing of the parent's interrupt
        // state or mask depth; only FiberRef values are inherited (see
        // `refs.rs`). Each fiber is its own cancellation domain.
        FiberSignal::new()
    }

    /// Requests cooperative cancellation of whatever task this signal is
    /// scoped into (via `FIBER_SIGNAL.scope`). Idempotent; unlike
    /// `JoinHandle::abort`, this does not kill the task — it only wakes it
    /// at its next unmasked [`cancellable`] suspension point, letting any
    /// enclosing `ensuring`/`acquire_release`/layer-teardown finish
    /// uninterruptibly before the task actually completes.
    pub(crate) fn interrupt(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

tokio::task_local! {
    pub(crate) static FIBER_SIGNAL: FiberSignal;
}

pub(crate) fn enter_mask() {
    let _ = FIBER_SIGNAL.try_with(|s| s.mask_depth.fetch_add(1, Ordering::SeqCst));
}

pub(crate) fn exit_mask() {
    let _ = FIBER_SIGNAL.try_with(|s| s.mask_depth.fetch_sub(1, Ordering::SeqCst));
}

pub(crate) fn current_mask_depth() -> u32 {
    FIBER_SIGNAL
        .try_with(|s| s.mask_depth.load(Ordering::SeqCst))
        .unwrap_or(0)
}

/// Swaps the current mask depth for `depth`, returning the previous value.
/// Used by `Restore::apply` to genuinely lift an enclosing mask.
pub(crate) fn swap_mask_depth(depth: u32) -> u32 {
    FIBER_SIGNAL
        .try_with(|s| s.mask_depth.swap(depth, Ordering::SeqCst))
        .unwrap_or(0)
}

pub(crate) fn is_masked() -> bool {
    current_mask_depth() > 0
}

pub(crate) fn request_interrupt() {
    let _ = FIBER_SIGNAL.try_with(|s| {
        s.requested.store(true, Ordering::SeqCst);
        s.notify.notify_waiters();
    });
}

/// The result of racing a future against this fiber's interrupt signal.
pub(crate) enum Outcome<T> {
    Completed(T),
    Interrupted,
}

/// Runs `fut` to completion unless this fiber is interrupted while unmasked,
/// in which case the wait is abandoned and `Interrupted` is returned.
///
/// If called outside of any fiber's task-local scope (e.g. `Runtime::run`
/// without a fork), there is no interrupt source, so `fut` always runs to
/// completion.
pub(crate) async fn cancellable<Fut: Future>(fut: Fut) -> Outcome<Fut::Output> {
    if is_masked() {
        return Outcome::Completed(fut.await);
    }
    let Ok(sig) = FIBER_SIGNAL.try_with(|s| s.clone()) else {
        return Outcome::Completed(fut.await);
    };
    if sig.requested.load(Ordering::SeqCst) {
        return Outcome::Interrupted;
    }
    tokio::pin!(fut);
    loop {
        tokio::select! {
            v = &mut fut => return Outcome::Completed(v),
            _ = sig.notify.notified() => {
                if sig.requested.load(Ordering::SeqCst) && current_mask_depth() == 0 {
                    return Outcome::Interrupted;
                }
            }
        }
    }
}

/// A handle to a running [`Effect`](crate::effect::Effect).
pub struct Fiber<E, A> {
    id: u64,
    name: Option<String>,
    handle: JoinHandle<Exit<E, A>>,
    signal: FiberSignal,
    status: Arc<std::sync::Mutex<FiberStatus>>,
}

/// The fiber's observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl<E, A> Fiber<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// This fiber's stable, process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The name it was forked with, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The fiber's current status.
    pub fn status(&self) -> FiberStatus {
        *self.status.lock().unwrap()
    }

    /// Requests cancellation. Idempotent; safe to call from any fiber
    /// (including this one's own body, though that only takes effect at the
    /// next suspension point).
    pub fn interrupt(&self) {
        self.signal.interrupt();
    }

    /// Blocks until the fiber terminates, materializing its outcome as an
    /// [`Exit`] rather than propagating failures.
    pub async fn await_(self) -> Exit<E, A> {
        let status = self.status;
        match self.handle.await {
            Ok(exit) => {
                *status.lock().unwrap() = if exit.is_success() {
                    FiberStatus::Done
                } else {
                    FiberStatus::Failed
                };
                exit
            }
            Err(join_err) => {
                if join_err.is_cancelled() {
                    *status.lock().unwrap() = FiberStatus::Cancelled;
                    Exit::Failure(Cause::interrupt())
                } else {
                    *status.lock().unwrap() = FiberStatus::Failed;
                    Exit::Failure(Cause::die(Defect::from_panic(join_err.into_panic())))
                }
            }
        }
    }

    /// Like [`await_`](Self::await_), but surfaces a failure `Cause` as
    /// `Err` instead of folding it into a uniform `Exit`.
    pub async fn join(self) -> Result<A, Cause<E>> {
        self.await_().await.into_result()
    }
}

/// Observes fiber lifecycle events. The default implementation does
/// nothing; override to hook monitoring, logging, or restart policies.
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    /// Called immediately after a fiber is forked.
    async fn on_start(&self, _id: u64, _name: Option<&str>) {}
    /// Called for any non-success, non-interrupt outcome. `rendered_cause`
    /// is the failing [`Cause`]'s [`render`](Cause::render) output — kept
    /// as a plain string rather than a generic `Cause<E>` so `Supervisor`
    /// stays object-safe and a single `Runtime` can fork fibers of many
    /// different error types under one supervisor.
    async fn on_failure(&self, _id: u64, _rendered_cause: &str) {}
    /// Called exactly once, after `on_failure` (if applicable), for every
    /// terminated fiber.
    async fn on_end(&self, _id: u64) {}
}

/// The no-op default supervisor.
#[derive(Default)]
pub struct NoopSupervisor;

#[async_trait::async_trait]
impl Supervisor for NoopSupervisor {}

/// Holds a base [`Context`] and drives [`Effect`](crate::effect::Effect)s,
/// either inline (`run`) or on their own fiber (`fork`).
#[derive(Clone)]
pub struct Runtime {
    base: Context,
    supervisor: Arc<dyn Supervisor>,
    backend: Arc<dyn Backend>,
    config: Arc<RuntimeConfig>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(Context::new())
    }
}

impl Runtime {
    /// A runtime over `base`, with the no-op supervisor, the default
    /// `TokioBackend`, and a default `RuntimeConfig`.
    pub fn new(base: Context) -> Self {
        Runtime {
            base,
            supervisor: Arc::new(NoopSupervisor),
            backend: Arc::new(TokioBackend),
            config: Arc::new(RuntimeConfig::default()),
        }
    }

    /// Builds a fresh base [`Context`] and a `Runtime` over it per `config`,
    /// binding a `ConsoleLogger` first if
    /// [`install_default_logger`](RuntimeConfig::install_default_logger) is
    /// set.
    pub async fn bootstrap(config: RuntimeConfig) -> Self {
        let base = if config.install_default_logger {
            crate::services::logger::logger_layer()
                .build(&Context::new())
                .await
                .unwrap_or_else(|_| Context::new())
        } else {
            Context::new()
        };
        Runtime::new(base).with_config(config)
    }

    /// Attaches a supervisor, replacing the default no-op one.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Swaps in a different [`Backend`], replacing the default `TokioBackend`.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replaces this runtime's [`RuntimeConfig`].
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// This runtime's [`Backend`].
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// This runtime's [`RuntimeConfig`].
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The runtime's base [`Context`], inherited by every effect it runs.
    pub fn context(&self) -> &Context {
        &self.base
    }

    /// Runs `eff` to completion in the current task, without forking a
    /// fiber. Convenient for the outermost entry point of a program.
    pub async fn run<E, A>(&self, eff: crate::effect::Effect<E, A>) -> Exit<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        eff.run(self.base.clone()).await
    }

    /// Runs `eff`, closing `scope` afterward regardless of outcome.
    pub async fn run_scoped<E, A>(
        &self,
        eff: crate::effect::Effect<E, A>,
        scope: &crate::scope::Scope,
    ) -> Exit<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let exit = self.run(eff).await;
        scope.close_with_context(&self.base).await;
        exit
    }

    /// Forks `eff` onto its own fiber, returning immediately with a handle.
    ///
    /// The forked fiber inherits the runtime's base `Context` and the
    /// caller's current `FiberRef` values (copy-on-write: subsequent
    /// mutations in the child are invisible to the parent and vice versa),
    /// but starts with a fresh, independent interrupt signal. A forked
    /// fiber is *not* cancelled automatically when the forking effect
    /// returns — only parallel combinators (`zip_par`, `race*`,
    /// `for_each_par`, `merge_all`) cancel the children they directly
    /// start; fibers created via `fork` are independent until joined or
    /// interrupted explicitly.
    pub fn fork<E, A>(&self, eff: crate::effect::Effect<E, A>, name: Option<String>) -> Fiber<E, A>
    where
        E: Send + Sync + std::fmt::Display + 'static,
        A: Send + 'static,
    {
        let id = next_fiber_id();
        let name = name.or_else(|| {
            self.config
                .name_prefix
                .as_ref()
                .map(|prefix| format!("{prefix}-{id}"))
        });
        let base = self.base.clone();
        let supervisor = self.supervisor.clone();
        let signal = FIBER_SIGNAL
            .try_with(|s| s.child())
            .unwrap_or_else(FiberSignal::new);
        let name_for_task = name.clone();
        let inherited = crate::refs::snapshot_task_locals();

        let handle = tokio::spawn(FIBER_SIGNAL.scope(signal.clone(), async move {
            supervisor.on_start(id, name_for_task.as_deref()).await;
            let exit = crate::refs::with_inherited_task_locals(inherited, eff.run(base)).await;
            if let Exit::Failure(cause) = &exit {
                if !cause.is_interrupt() {
                    supervisor.on_failure(id, &cause.render()).await;
                }
            }
            supervisor.on_end(id).await;
            exit
        }));

        Fiber {
            id,
            name,
            handle,
            signal,
            status: Arc::new(std::sync::Mutex::new(FiberStatus::Running)),
        }
    }
}
