//! Lazy, re-invokable computations with explicit success/failure channels.
//!
//! An [`Effect<E, A>`] is a cloneable description of "run this against a
//! [`Context`], eventually produce `A` or a [`Cause<E>`]" — nothing runs
//! until [`Effect::run`] is called. Because [`retry`](Effect::retry) and
//! [`repeat`](Effect::repeat) must invoke the same value more than once, the
//! representation is a re-invokable `Fn`, not an `FnOnce`: internally an
//! `Arc<dyn Fn(Context) -> BoxFuture<Exit<E, A>>>`, cheaply `Clone`.
//!
//! `R`, the environment requirement from the spec's `Effect<R,E,A>`, is not
//! threaded as a type parameter here: like the reference implementation,
//! required services are pulled out of the ambient [`Context`] with
//! [`Context::get`] at the point of use, so `R` is documented rather than
//! encoded in the type.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt as _;

use crate::cause::{Cause, Exit};
use crate::context::Context;
use crate::error::{Defect, RuntimeError};
use crate::fiber::{cancellable, Outcome};
use crate::layer::Layer;
use crate::schedule::Schedule;
use crate::scope::Scope;

type RunFuture<E, A> = Pin<Box<dyn Future<Output = Exit<E, A>> + Send>>;
type RunFn<E, A> = dyn Fn(Context) -> RunFuture<E, A> + Send + Sync;

/// A lazy, re-invokable description of a computation against a [`Context`].
pub struct Effect<E, A> {
    f: Arc<RunFn<E, A>>,
}

impl<E, A> Clone for Effect<E, A> {
    fn clone(&self) -> Self {
        Effect { f: self.f.clone() }
    }
}

impl<E, A> fmt::Debug for Effect<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

/// Converts a completed or aborted/panicked task join into an [`Exit`].
///
/// A `JoinError` from an aborted task becomes [`Cause::interrupt`]; one from
/// a panic becomes [`Cause::die`] carrying the panic payload.
fn exit_from_join_error<E, A>(err: tokio::task::JoinError) -> Exit<E, A> {
    if err.is_cancelled() {
        Exit::Failure(Cause::interrupt())
    } else {
        Exit::Failure(Cause::die(Defect::from_panic(err.into_panic())))
    }
}

fn join_result_to_exit<E, A>(r: Result<Exit<E, A>, tokio::task::JoinError>) -> Exit<E, A> {
    match r {
        Ok(exit) => exit,
        Err(e) => exit_from_join_error(e),
    }
}

/// Spawns `eff` on its own task, scoped to a fresh [`FiberSignal`] so it can
/// be cancelled *cooperatively* rather than hard-aborted: cancelling the
/// returned signal only wakes the task at its next unmasked `cancellable`
/// suspension point, so an `ensuring`/`acquire_release`/layer-teardown
/// finalizer already in flight inside `eff` still gets to run to completion
/// before the task exits. Callers that need to cancel must call
/// `signal.interrupt()` and then `.await` the returned handle (not
/// `.abort()` it) to let that finalizer run.
fn spawn_cancellable<E, A>(
    eff: Effect<E, A>,
    ctx: Context,
) -> (tokio::task::JoinHandle<Exit<E, A>>, crate::fiber::FiberSignal)
where
    E: Send + 'static,
    A: Send + 'static,
{
    let signal = crate::fiber::FiberSignal::new();
    let sig = signal.clone();
    let handle = tokio::spawn(crate::fiber::FIBER_SIGNAL.scope(sig, async move { eff.run(ctx).await }));
    (handle, signal)
}

/// Re-types a `Cause` known not to carry an `E` payload at its root.
///
/// Only ever called on a [`Cause::Die`] or [`Cause::Interrupt`] leaf: this
/// crate's own combinators never construct `Then`/`Both` (see
/// `zip_par`/`race*`'s doc comments — the losing sibling's outcome is always
/// discarded, never composed), and `Fail` is always matched and handled
/// before falling through to this helper.
fn retype_leaf_cause<E, E2>(cause: Cause<E>) -> Cause<E2> {
    match cause {
        Cause::Die(d, ann) => Cause::Die(d, ann),
        Cause::Interrupt(ann) => Cause::Interrupt(ann),
        Cause::Fail(_, _) | Cause::Then(_, _, _) | Cause::Both(_, _, _) => {
            unreachable!("caller already handled Fail; this crate never constructs Then/Both")
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} over an empty collection")]
struct EmptyRace(&'static str);

#[derive(Debug, thiserror::Error)]
#[error("unrefined error: {0}")]
struct UnrefinedError(String);

impl<E, A> Effect<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Builds an effect directly from a context-consuming run function.
    /// Crate-internal: modules that need to read a service out of the
    /// `Context` (`clock::sleep`, `services::logger::log_swallowed`'s
    /// callers, `Stream`'s stage wrappers, ...) construct their effects this
    /// way, the same way the reference implementation's own service helpers
    /// build an `Effect(run)` closing over `ctx` directly.
    pub(crate) fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<E, A>> + Send + 'static,
    {
        Effect {
            f: Arc::new(move |ctx| Box::pin(f(ctx)) as RunFuture<E, A>),
        }
    }

    /// Interprets this effect against `ctx`, producing its [`Exit`].
    pub async fn run(&self, ctx: Context) -> Exit<E, A> {
        (self.f)(ctx).await
    }

    /// Convenience for running against an empty [`Context`].
    pub async fn run_default(&self) -> Exit<E, A> {
        self.run(Context::new()).await
    }

    /// Immediately produces `a`.
    pub fn succeed(a: A) -> Self
    where
        A: Clone + Sync,
    {
        Effect::new(move |_ctx| {
            let a = a.clone();
            async move { Exit::Success(a) }
        })
    }

    /// Immediately fails with `e`.
    pub fn fail(e: E) -> Self
    where
        E: Clone + Sync,
    {
        Effect::new(move |_ctx| {
            let e = e.clone();
            async move { Exit::Failure(Cause::fail(e)) }
        })
    }

    /// Immediately dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Effect::new(move |_ctx| {
            let defect = defect.clone();
            async move { Exit::Failure(Cause::die(defect)) }
        })
    }

    /// Immediately interrupts.
    pub fn interrupted() -> Self {
        Effect::new(|_ctx| async { Exit::Failure(Cause::interrupt()) })
    }

    /// Evaluates a synchronous function; a panic becomes a [`Cause::Die`].
    pub fn sync<F>(thunk: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Effect::new(move |_ctx| {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(&thunk));
            async move {
                match outcome {
                    Ok(a) => Exit::Success(a),
                    Err(payload) => Exit::Failure(Cause::die(Defect::from_panic(payload))),
                }
            }
        })
    }

    /// Evaluates a synchronous function, mapping a panic to a typed failure
    /// via `on_error` rather than letting it become a [`Cause::Die`].
    pub fn attempt<F, OnErr>(thunk: F, on_error: OnErr) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        OnErr: Fn(Box<dyn std::any::Any + Send>) -> E + Send + Sync + 'static,
    {
        Effect::new(move |_ctx| {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(&thunk));
            let mapped = outcome.map_err(&on_error);
            async move {
                match mapped {
                    Ok(a) => Exit::Success(a),
                    Err(e) => Exit::Failure(Cause::fail(e)),
                }
            }
        })
    }

    /// Awaits an asynchronous computation produced fresh on each invocation.
    /// A panic inside `thunk`'s future becomes a [`Cause::Die`]; cancellation
    /// of the enclosing fiber aborts the inner future and yields `Interrupt`.
    pub fn async_<F, Fut>(thunk: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = A> + Send + 'static,
    {
        Effect::new(move |_ctx| {
            let fut = thunk();
            async move {
                match cancellable(AssertUnwindSafe(fut).catch_unwind()).await {
                    Outcome::Completed(Ok(a)) => Exit::Success(a),
                    Outcome::Completed(Err(payload)) => {
                        Exit::Failure(Cause::die(Defect::from_panic(payload)))
                    }
                    Outcome::Interrupted => Exit::Failure(Cause::interrupt()),
                }
            }
        })
    }

    /// Applies `f` to a success; propagates any failure unchanged.
    pub fn map<B, F>(self, f: F) -> Effect<E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
        B: Send + 'static,
    {
        let f = Arc::new(f);
        Effect::new(move |ctx| {
            let this = self.clone();
            let f = f.clone();
            async move {
                match this.run(ctx).await {
                    Exit::Success(a) => Exit::Success((f)(a)),
                    Exit::Failure(c) => Exit::Failure(c),
                }
            }
        })
    }

    /// Sequences: `k` is invoked only on success; any failure short-circuits.
    pub fn flat_map<B, F>(self, k: F) -> Effect<E, B>
    where
        F: Fn(A) -> Effect<E, B> + Send + Sync + 'static,
        B: Send + 'static,
    {
        let k = Arc::new(k);
        Effect::new(move |ctx| {
            let this = self.clone();
            let k = k.clone();
            async move {
                match this.run(ctx.clone()).await {
                    Exit::Success(a) => (k)(a).run(ctx).await,
                    Exit::Failure(c) => Exit::Failure(c),
                }
            }
        })
    }

    /// On [`Cause::Fail`] only (never `Die`/`Interrupt`), replaces with
    /// `h(e)`.
    pub fn catch_all<E2, F>(self, h: F) -> Effect<E2, A>
    where
        F: Fn(E) -> Effect<E2, A> + Send + Sync + 'static,
        E2: Send + 'static,
    {
        let h = Arc::new(h);
        Effect::new(move |ctx| {
            let this = self.clone();
            let h = h.clone();
            async move {
                match this.run(ctx.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(Cause::Fail(e, _ann)) => (h)(e).run(ctx).await,
                    Exit::Failure(other) => Exit::Failure(retype_leaf_cause(other)),
                }
            }
        })
    }

    /// Total recovery of `Fail` into a plain value; `Die`/`Interrupt` still
    /// propagate (the error type is unchanged so their `Cause<E>` carries
    /// through untouched).
    pub fn fold<B, OnErr, OnOk>(self, on_error: OnErr, on_success: OnOk) -> Effect<E, B>
    where
        OnErr: Fn(E) -> B + Send + Sync + 'static,
        OnOk: Fn(A) -> B + Send + Sync + 'static,
        B: Send + 'static,
    {
        let on_error = Arc::new(on_error);
        let on_success = Arc::new(on_success);
        Effect::new(move |ctx| {
            let this = self.clone();
            let on_error = on_error.clone();
            let on_success = on_success.clone();
            async move {
                match this.run(ctx).await {
                    Exit::Success(a) => Exit::Success((on_success)(a)),
                    Exit::Failure(Cause::Fail(e, _ann)) => Exit::Success((on_error)(e)),
                    Exit::Failure(other) => Exit::Failure(other),
                }
            }
        })
    }

    /// Like [`fold`](Self::fold), but recovers into effects rather than
    /// plain values; `Die`/`Interrupt` still propagate.
    pub fn fold_effect<E2, B, OnErr, OnOk>(self, on_error: OnErr, on_success: OnOk) -> Effect<E2, B>
    where
        OnErr: Fn(E) -> Effect<E2, B> + Send + Sync + 'static,
        OnOk: Fn(A) -> Effect<E2, B> + Send + Sync + 'static,
        E2: Send + 'static,
        B: Send + 'static,
    {
        let on_error = Arc::new(on_error);
        let on_success = Arc::new(on_success);
        Effect::new(move |ctx| {
            let this = self.clone();
            let on_error = on_error.clone();
            let on_success = on_success.clone();
            async move {
                match this.run(ctx.clone()).await {
                    Exit::Success(a) => (on_success)(a).run(ctx).await,
                    Exit::Failure(Cause::Fail(e, _ann)) => (on_error)(e).run(ctx).await,
                    Exit::Failure(other) => Exit::Failure(retype_leaf_cause(other)),
                }
            }
        })
    }

    /// Alias for [`fold_effect`](Self::fold_effect).
    pub fn match_effect<E2, B, OnErr, OnOk>(self, on_error: OnErr, on_success: OnOk) -> Effect<E2, B>
    where
        OnErr: Fn(E) -> Effect<E2, B> + Send + Sync + 'static,
        OnOk: Fn(A) -> Effect<E2, B> + Send + Sync + 'static,
        E2: Send + 'static,
        B: Send + 'static,
    {
        self.fold_effect(on_error, on_success)
    }

    /// Maps the failure's error value; `Die`/`Interrupt` are unaffected.
    pub fn map_error<E2, F>(self, f: F) -> Effect<E2, A>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
        E2: Send + 'static,
    {
        let f = Arc::new(f);
        Effect::new(move |ctx| {
            let this = self.clone();
            let f = f.clone();
            async move {
                match this.run(ctx).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(Cause::Fail(e, ann)) => Exit::Failure(Cause::Fail((f)(e), ann)),
                    Exit::Failure(other) => Exit::Failure(retype_leaf_cause(other)),
                }
            }
        })
    }

    /// Refines the error type; when `pf` returns `None` the failure is
    /// converted into a defect (a [`Cause::Die`]) instead — the error was
    /// not one this effect's caller declared it could recover from.
    pub fn refine_or_die<E2, F>(self, pf: F) -> Effect<E2, A>
    where
        F: Fn(&E) -> Option<E2> + Send + Sync + 'static,
        E: fmt::Debug,
        E2: Send + 'static,
    {
        let pf = Arc::new(pf);
        Effect::new(move |ctx| {
            let this = self.clone();
            let pf = pf.clone();
            async move {
                match this.run(ctx).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(Cause::Fail(e, ann)) => match (pf)(&e) {
                        Some(e2) => Exit::Failure(Cause::Fail(e2, ann)),
                        None => {
                            Exit::Failure(Cause::die(Defect::new(UnrefinedError(format!("{e:?}")))))
                        }
                    },
                    Exit::Failure(other) => Exit::Failure(retype_leaf_cause(other)),
                }
            }
        })
    }

    /// Strictly sequential pairing: `self` first, then `other`; the first
    /// failure wins.
    pub fn zip<B>(self, other: Effect<E, B>) -> Effect<E, (A, B)>
    where
        B: Send + 'static,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let other = other.clone();
            async move {
                match this.run(ctx.clone()).await {
                    Exit::Success(a) => match other.run(ctx).await {
                        Exit::Success(b) => Exit::Success((a, b)),
                        Exit::Failure(c) => Exit::Failure(c),
                    },
                    Exit::Failure(c) => Exit::Failure(c),
                }
            }
        })
    }

    /// Like [`zip`](Self::zip), combining the pair with `f` instead of
    /// tupling.
    pub fn zip_with<B, C, F>(self, other: Effect<E, B>, f: F) -> Effect<E, C>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Effect::new(move |ctx| {
            let this = self.clone();
            let other = other.clone();
            let f = f.clone();
            async move {
                match this.run(ctx.clone()).await {
                    Exit::Success(a) => match other.run(ctx).await {
                        Exit::Success(b) => Exit::Success((f)(a, b)),
                        Exit::Failure(c) => Exit::Failure(c),
                    },
                    Exit::Failure(c) => Exit::Failure(c),
                }
            }
        })
    }

    /// Runs `fin` on every exit path of `self` (success, fail, die,
    /// interrupt). `fin` itself runs uninterruptibly and its outcome — even
    /// a failure — is swallowed, logged at the boundary if a
    /// [`Logger`](crate::services::logger::Logger) is present in `ctx`.
    pub fn ensuring<FE, FA>(self, fin: Effect<FE, FA>) -> Effect<E, A>
    where
        FE: fmt::Display + Send + 'static,
        FA: Send + 'static,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let fin = uninterruptible(fin.clone());
            async move {
                let result = this.run(ctx.clone()).await;
                let fin_exit = fin.run(ctx.clone()).await;
                if let Exit::Failure(cause) = &fin_exit {
                    crate::services::logger::log_swallowed(&ctx, "ensuring finalizer", &cause.render()).await;
                }
                result
            }
        })
    }

    /// Runs `side(e)` when (and only when) this effect fails with a typed
    /// `Fail(e)`, then re-raises the original failure. `Die`/`Interrupt`
    /// pass straight through without invoking `side`.
    pub fn on_error<FE, FA, F>(self, side: F) -> Effect<E, A>
    where
        F: Fn(E) -> Effect<FE, FA> + Send + Sync + 'static,
        E: Clone,
        FE: fmt::Display + Send + 'static,
        FA: Send + 'static,
    {
        let side = Arc::new(side);
        Effect::new(move |ctx| {
            let this = self.clone();
            let side = side.clone();
            async move {
                let exit = this.run(ctx.clone()).await;
                if let Exit::Failure(Cause::Fail(e, _)) = &exit {
                    let fin_exit = (side)(e.clone()).run(ctx.clone()).await;
                    if let Exit::Failure(cause) = &fin_exit {
                        crate::services::logger::log_swallowed(&ctx, "on_error side effect", &cause.render()).await;
                    }
                }
                exit
            }
        })
    }

    /// Runs `side` when (and only when) this effect is interrupted, then
    /// re-raises the interrupt.
    pub fn on_interrupt<FE, FA>(self, side: Effect<FE, FA>) -> Effect<E, A>
    where
        FE: fmt::Display + Send + 'static,
        FA: Send + 'static,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let side = side.clone();
            async move {
                let exit = this.run(ctx.clone()).await;
                if matches!(&exit, Exit::Failure(c) if c.is_interrupt()) {
                    let fin_exit = side.run(ctx.clone()).await;
                    if let Exit::Failure(cause) = &fin_exit {
                        crate::services::logger::log_swallowed(&ctx, "on_interrupt side effect", &cause.render()).await;
                    }
                }
                exit
            }
        })
    }

    /// Appends `note` to the annotation list of a [`Cause::Fail`] raised
    /// through this effect. `Die`/`Interrupt` are left unannotated, matching
    /// the reference implementation (it only catches the typed-failure
    /// exception, not arbitrary ones).
    pub fn annotate(self, note: impl Into<String>) -> Effect<E, A> {
        let note: Arc<str> = Arc::from(note.into());
        Effect::new(move |ctx| {
            let this = self.clone();
            let note = note.clone();
            async move {
                match this.run(ctx).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => {
                        if matches!(cause, Cause::Fail(_, _)) {
                            Exit::Failure(crate::cause::annotate_cause(cause, note.to_string()))
                        } else {
                            Exit::Failure(cause)
                        }
                    }
                }
            }
        })
    }

    /// Runs `self` with a deadline; on expiry the inner computation is
    /// dropped (ending its suspension) and `None` is produced instead of a
    /// failure.
    pub fn timeout(self, d: Duration) -> Effect<E, Option<A>> {
        Effect::new(move |ctx| {
            let this = self.clone();
            async move {
                match cancellable(tokio::time::timeout(d, this.run(ctx))).await {
                    Outcome::Completed(Ok(exit)) => match exit {
                        Exit::Success(a) => Exit::Success(Some(a)),
                        Exit::Failure(cause) => Exit::Failure(cause),
                    },
                    Outcome::Completed(Err(_elapsed)) => Exit::Success(None),
                    Outcome::Interrupted => Exit::Failure(Cause::interrupt()),
                }
            }
        })
    }

    /// On `Fail` only, consults `schedule`; on `continue`, sleeps the
    /// returned delay and re-evaluates. `Die`/`Interrupt` never retry.
    pub fn retry<S, Out>(self, schedule: Schedule<S, E, Out>) -> Effect<E, A>
    where
        E: Clone,
        S: Clone + Send + Sync + 'static,
        Out: Send + 'static,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let schedule = schedule.clone();
            async move {
                schedule.reset();
                loop {
                    match this.run(ctx.clone()).await {
                        Exit::Success(a) => return Exit::Success(a),
                        Exit::Failure(Cause::Fail(e, ann)) => {
                            let (cont, delay, _out) = schedule.step(&e);
                            if !cont {
                                return Exit::Failure(Cause::Fail(e, ann));
                            }
                            if !delay.is_zero() {
                                if let Outcome::Interrupted = cancellable(tokio::time::sleep(delay)).await {
                                    return Exit::Failure(Cause::interrupt());
                                }
                            }
                        }
                        other => return other,
                    }
                }
            }
        })
    }

    /// On success, consults `schedule`; on `continue`, sleeps the returned
    /// delay and re-evaluates. Any failure terminates immediately.
    pub fn repeat<S, Out>(self, schedule: Schedule<S, A, Out>) -> Effect<E, A>
    where
        S: Clone + Send + Sync + 'static,
        Out: Send + 'static,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let schedule = schedule.clone();
            async move {
                schedule.reset();
                loop {
                    match this.run(ctx.clone()).await {
                        Exit::Success(a) => {
                            let (cont, delay, _out) = schedule.step(&a);
                            if !cont {
                                return Exit::Success(a);
                            }
                            if !delay.is_zero() {
                                if let Outcome::Interrupted = cancellable(tokio::time::sleep(delay)).await {
                                    return Exit::Failure(Cause::interrupt());
                                }
                            }
                        }
                        failure => return failure,
                    }
                }
            }
        })
    }

    /// Builds `layer`, runs `self` with the enriched context, then tears the
    /// layer down — regardless of `self`'s outcome.
    pub fn provide(self, layer: Layer) -> Effect<E, A>
    where
        E: From<RuntimeError>,
    {
        Effect::new(move |ctx| {
            let this = self.clone();
            let layer = layer.clone();
            async move {
                match layer.build(&ctx).await {
                    Ok(sub_ctx) => {
                        let result = this.run(sub_ctx.clone()).await;
                        layer.teardown(&sub_ctx).await;
                        result
                    }
                    Err(err) => Exit::Failure(Cause::die(Defect::new(err))),
                }
            }
        })
    }

    /// Like [`provide`](Self::provide), but registers the layer's teardown
    /// with a fresh [`Scope`] instead of running it inline, so the
    /// resource's lifetime can outlive this single invocation if `self`
    /// itself captures and returns the scope.
    pub fn provide_scoped(self, layer: Layer) -> Effect<E, A> {
        Effect::new(move |ctx| {
            let this = self.clone();
            let layer = layer.clone();
            async move {
                let scope = Scope::new();
                match layer.build_scoped(&ctx, &scope).await {
                    Ok(sub_ctx) => {
                        let result = this.run(sub_ctx).await;
                        scope.close_with_context(&ctx).await;
                        result
                    }
                    Err(err) => {
                        scope.close_with_context(&ctx).await;
                        Exit::Failure(Cause::die(Defect::new(err)))
                    }
                }
            }
        })
    }
}

impl<E> Effect<E, ()>
where
    E: Send + 'static,
{
    /// Suspends for `d`. A suspension point: cancellation observed here
    /// abandons the wait and yields `Interrupt` without sleeping the full
    /// duration.
    pub fn sleep(d: Duration) -> Self {
        Effect::new(move |_ctx| async move {
            match cancellable(tokio::time::sleep(d)).await {
                Outcome::Completed(()) => Exit::Success(()),
                Outcome::Interrupted => Exit::Failure(Cause::interrupt()),
            }
        })
    }
}

/// Runs `f` with a freshly created [`Scope`], closing it when the built
/// effect completes regardless of outcome.
pub fn scoped<E, A, F>(f: F) -> Effect<E, A>
where
    F: Fn(Scope) -> Effect<E, A> + Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let f = Arc::new(f);
    Effect::new(move |ctx| {
        let f = f.clone();
        async move {
            let scope = Scope::new();
            let eff = (f)(scope.clone());
            let result = eff.run(ctx.clone()).await;
            scope.close_with_context(&ctx).await;
            result
        }
    })
}

/// Masks interrupts for `eff`'s extent: cancellation requested while `eff`
/// runs is deferred until it exits.
pub fn uninterruptible<E, A>(eff: Effect<E, A>) -> Effect<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::new(move |ctx| {
        let eff = eff.clone();
        async move {
            crate::fiber::enter_mask();
            let result = eff.run(ctx).await;
            crate::fiber::exit_mask();
            result
        }
    })
}

/// Lifts the enclosing [`uninterruptible_mask`] for an inner sub-effect's
/// extent — genuinely, not the no-op the reference implementation's
/// `restore` reduces to (see `SPEC_FULL.md` §9, Open Question 3). Captures
/// the mask depth as it stood *before* the enclosing mask was entered and
/// restores exactly that depth around `inner`, so cancellation delivered
/// during `inner` is observable again (unless an outer mask is still in
/// effect, in which case that depth is what gets restored to).
pub struct Restore(u32);

impl Restore {
    pub fn apply<E, A>(&self, inner: Effect<E, A>) -> Effect<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let depth_before = self.0;
        Effect::new(move |ctx| {
            let inner = inner.clone();
            async move {
                let saved = crate::fiber::swap_mask_depth(depth_before);
                let result = inner.run(ctx).await;
                crate::fiber::swap_mask_depth(saved);
                result
            }
        })
    }
}

/// Builds an uninterruptible effect whose body can selectively re-enable
/// interruption for a sub-effect via the supplied [`Restore`].
pub fn uninterruptible_mask<E, A, F>(f: F) -> Effect<E, A>
where
    F: Fn(Restore) -> Effect<E, A> + Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let f = Arc::new(f);
    Effect::new(move |ctx| {
        let f = f.clone();
        async move {
            let depth_before = crate::fiber::current_mask_depth();
            crate::fiber::enter_mask();
            let body = (f)(Restore(depth_before));
            let result = body.run(ctx).await;
            crate::fiber::exit_mask();
            result
        }
    })
}

/// Resource bracket: `acquire` is uninterruptible, `use_` is interruptible,
/// `release` is uninterruptible and always runs exactly once after `use_`
/// (even if `use_` failed, died, or was interrupted). A `release` failure is
/// swallowed to preserve the original outcome, logged at the boundary if a
/// logger is present.
///
/// `acquire` and `use_` share one failure type `E` — a deliberate
/// simplification of the spec's `E | E2` union (Rust has no native error
/// union); call [`Effect::map_error`] on one side first to unify mismatched
/// error types.
pub fn acquire_release<E, A, B, Rel, Use>(acquire: Effect<E, A>, release: Rel, use_: Use) -> Effect<E, B>
where
    E: fmt::Display + Send + 'static,
    A: Clone + Send + 'static,
    B: Send + 'static,
    Rel: Fn(A) -> Effect<E, ()> + Send + Sync + 'static,
    Use: Fn(A) -> Effect<E, B> + Send + Sync + 'static,
{
    let release = Arc::new(release);
    let use_ = Arc::new(use_);
    Effect::new(move |ctx| {
        let acquire = uninterruptible(acquire.clone());
        let release = release.clone();
        let use_ = use_.clone();
        async move {
            match acquire.run(ctx.clone()).await {
                Exit::Failure(cause) => Exit::Failure(cause),
                Exit::Success(a) => {
                    let use_result = (use_)(a.clone()).run(ctx.clone()).await;
                    let rel_exit = uninterruptible((release)(a)).run(ctx.clone()).await;
                    if let Exit::Failure(cause) = &rel_exit {
                        crate::services::logger::log_swallowed(&ctx, "acquire_release release", &cause.render()).await;
                    }
                    use_result
                }
            }
        }
    })
}

/// Runs both effects concurrently; on one's failure, cancels the other and
/// yields that failure (never `Both` — the cancelled sibling's outcome is
/// always discarded, matching the spec's testable property that `zip_par`'s
/// aggregate exit is the failing side's `Fail` alone). Cancellation is
/// cooperative (see [`spawn_cancellable`]): the loser is signalled and
/// awaited to completion, not hard-aborted, so any `ensuring`/
/// `acquire_release` release nested inside it still runs.
pub fn zip_par<E, A, B>(e1: Effect<E, A>, e2: Effect<E, B>) -> Effect<E, (A, B)>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    Effect::new(move |ctx| {
        let e1 = e1.clone();
        let e2 = e2.clone();
        let ctx2 = ctx.clone();
        async move {
            let (mut t1, sig1) = spawn_cancellable(e1, ctx);
            let (mut t2, sig2) = spawn_cancellable(e2, ctx2);
            tokio::select! {
                r1 = &mut t1 => {
                    match join_result_to_exit(r1) {
                        Exit::Failure(cause) => {
                            sig2.interrupt();
                            let _ = t2.await;
                            Exit::Failure(cause)
                        }
                        Exit::Success(a) => match join_result_to_exit(t2.await) {
                            Exit::Success(b) => Exit::Success((a, b)),
                            Exit::Failure(cause) => Exit::Failure(cause),
                        },
                    }
                }
                r2 = &mut t2 => {
                    match join_result_to_exit(r2) {
                        Exit::Failure(cause) => {
                            sig1.interrupt();
                            let _ = t1.await;
                            Exit::Failure(cause)
                        }
                        Exit::Success(b) => match join_result_to_exit(t1.await) {
                            Exit::Success(a) => Exit::Success((a, b)),
                            Exit::Failure(cause) => Exit::Failure(cause),
                        },
                    }
                }
            }
        }
    })
}

/// Returns the first of `e1`/`e2` to complete, success or failure; cancels
/// the loser cooperatively (see [`spawn_cancellable`]).
pub fn race<E, A>(e1: Effect<E, A>, e2: Effect<E, A>) -> Effect<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::new(move |ctx| {
        let e1 = e1.clone();
        let e2 = e2.clone();
        let ctx2 = ctx.clone();
        async move {
            let (mut t1, sig1) = spawn_cancellable(e1, ctx);
            let (mut t2, sig2) = spawn_cancellable(e2, ctx2);
            tokio::select! {
                r = &mut t1 => { sig2.interrupt(); let _ = t2.await; join_result_to_exit(r) }
                r = &mut t2 => { sig1.interrupt(); let _ = t1.await; join_result_to_exit(r) }
            }
        }
    })
}

/// Races over a collection, returning the first result; cancels the rest
/// cooperatively (see [`spawn_cancellable`]).
pub fn race_first<E, A>(effects: Vec<Effect<E, A>>) -> Effect<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::new(move |ctx| {
        let effects = effects.clone();
        async move {
            if effects.is_empty() {
                return Exit::Failure(Cause::die(Defect::new(EmptyRace("race_first"))));
            }
            let mut set = tokio::task::JoinSet::new();
            let mut signals = Vec::new();
            for eff in effects {
                let ctx = ctx.clone();
                let signal = crate::fiber::FiberSignal::new();
                signals.push(signal.clone());
                set.spawn(crate::fiber::FIBER_SIGNAL.scope(signal, async move { eff.run(ctx).await }));
            }
            let result = match set.join_next().await {
                Some(r) => join_result_to_exit(r),
                None => unreachable!("checked non-empty above"),
            };
            for signal in &signals {
                signal.interrupt();
            }
            while set.join_next().await.is_some() {}
            result
        }
    })
}

/// Races over a collection, returning `(winner_index, value)`. When several
/// tasks complete in the same scheduler wakeup the one polled to completion
/// first (deterministic given `JoinSet`'s poll order) is reported — see
/// `SPEC_FULL.md` §9, Open Question 2. The rest are cancelled cooperatively
/// (see [`spawn_cancellable`]).
pub fn race_all<E, A>(effects: Vec<Effect<E, A>>) -> Effect<E, (usize, A)>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::new(move |ctx| {
        let effects = effects.clone();
        async move {
            if effects.is_empty() {
                return Exit::Failure(Cause::die(Defect::new(EmptyRace("race_all"))));
            }
            let mut set = tokio::task::JoinSet::new();
            let mut signals = Vec::new();
            for (i, eff) in effects.into_iter().enumerate() {
                let ctx = ctx.clone();
                let signal = crate::fiber::FiberSignal::new();
                signals.push(signal.clone());
                set.spawn(crate::fiber::FIBER_SIGNAL.scope(signal, async move { (i, eff.run(ctx).await) }));
            }
            let outcome = match set.join_next().await {
                Some(Ok((i, Exit::Success(a)))) => Exit::Success((i, a)),
                Some(Ok((_i, Exit::Failure(c)))) => Exit::Failure(c),
                Some(Err(join_err)) => exit_from_join_error(join_err),
                None => unreachable!("checked non-empty above"),
            };
            for signal in &signals {
                signal.interrupt();
            }
            while set.join_next().await.is_some() {}
            outcome
        }
    })
}

async fn run_ordered<E, A>(effects: Vec<Effect<E, A>>, parallelism: Option<usize>, ctx: Context) -> Exit<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    let total = effects.len();
    let sem = parallelism
        .filter(|&p| p > 0)
        .map(|p| Arc::new(tokio::sync::Semaphore::new(p)));
    let mut set = tokio::task::JoinSet::new();
    let mut signals = Vec::new();
    for (i, eff) in effects.into_iter().enumerate() {
        let ctx = ctx.clone();
        let sem = sem.clone();
        let signal = crate::fiber::FiberSignal::new();
        signals.push(signal.clone());
        set.spawn(crate::fiber::FIBER_SIGNAL.scope(signal, async move {
            let _permit = match &sem {
                Some(s) => Some(s.acquire_owned().await.expect("semaphore is never closed")),
                None => None,
            };
            (i, eff.run(ctx).await)
        }));
    }
    let mut results: Vec<Option<A>> = (0..total).map(|_| None).collect();
    let mut failure: Option<Cause<E>> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((i, Exit::Success(a))) => results[i] = Some(a),
            Ok((_i, Exit::Failure(c))) => {
                failure = Some(c);
                break;
            }
            Err(join_err) => {
                failure = Some(match exit_from_join_error::<E, ()>(join_err) {
                    Exit::Failure(c) => c,
                    Exit::Success(()) => unreachable!(),
                });
                break;
            }
        }
    }
    if let Some(cause) = failure {
        for signal in &signals {
            signal.interrupt();
        }
        while set.join_next().await.is_some() {}
        return Exit::Failure(cause);
    }
    Exit::Success(results.into_iter().map(|o| o.expect("every index filled")).collect())
}

async fn run_unordered<E, A>(effects: Vec<Effect<E, A>>, parallelism: Option<usize>, ctx: Context) -> Exit<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    let mut iter = effects.into_iter();
    let mut set = tokio::task::JoinSet::new();
    let mut signals: Vec<crate::fiber::FiberSignal> = Vec::new();
    let initial = match parallelism {
        Some(p) if p > 0 => p,
        _ => usize::MAX,
    };
    for eff in iter.by_ref().take(initial) {
        let ctx = ctx.clone();
        let signal = crate::fiber::FiberSignal::new();
        signals.push(signal.clone());
        set.spawn(crate::fiber::FIBER_SIGNAL.scope(signal, async move { eff.run(ctx).await }));
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Exit::Success(a)) => {
                results.push(a);
                if let Some(eff) = iter.next() {
                    let ctx = ctx.clone();
                    let signal = crate::fiber::FiberSignal::new();
                    signals.push(signal.clone());
                    set.spawn(crate::fiber::FIBER_SIGNAL.scope(signal, async move { eff.run(ctx).await }));
                }
            }
            Ok(Exit::Failure(cause)) => {
                for signal in &signals {
                    signal.interrupt();
                }
                while set.join_next().await.is_some() {}
                return Exit::Failure(cause);
            }
            Err(join_err) => {
                for signal in &signals {
                    signal.interrupt();
                }
                while set.join_next().await.is_some() {}
                return exit_from_join_error(join_err);
            }
        }
    }
    Exit::Success(results)
}

/// Bounded concurrent map over `items`, preserving input order. Any failure
/// cancels the remainder. `items` is cloned on every invocation of the
/// returned effect (required so the effect stays re-invokable for
/// `retry`/`repeat`), so `T: Clone`.
pub fn for_each_par<T, E, A, F>(items: Vec<T>, f: F, parallelism: usize) -> Effect<E, Vec<A>>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
    A: Send + 'static,
    F: Fn(T) -> Effect<E, A> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let parallelism = parallelism.max(1);
    Effect::new(move |ctx| {
        let items = items.clone();
        let f = f.clone();
        async move {
            let effects: Vec<Effect<E, A>> = items.into_iter().map(|x| (f)(x)).collect();
            run_ordered(effects, Some(parallelism), ctx).await
        }
    })
}

/// Runs `effects` with optional bounded parallelism, gathering results
/// either in input order (`preserve_order = true`, a strict gather that
/// cancels the rest on first failure) or in completion order (`false`, a
/// bounded pool refilling as each task completes).
pub fn merge_all<E, A>(effects: Vec<Effect<E, A>>, parallelism: Option<usize>, preserve_order: bool) -> Effect<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::new(move |ctx| {
        let effects = effects.clone();
        async move {
            if preserve_order {
                run_ordered(effects, parallelism, ctx).await
            } else {
                run_unordered(effects, parallelism, ctx).await
            }
        }
    })
}
