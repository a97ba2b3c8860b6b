//! Composable, memoized resource builders over [`Context`].
//!
//! A [`Layer`] pairs an `acquire` step (build a child `Context` from a
//! parent) with a `release` step (tear it down). Layers compose
//! sequentially (`+`, [`Layer::and_then`]) and in parallel (`⊕`,
//! [`Layer::or`]); both forms share a memo map for the duration of one
//! composite build so a leaf layer reachable through more than one path is
//! only ever acquired once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::RuntimeError;
use crate::scope::Scope;

/// Keys a layer's built instance in the per-build memo map. `from_resource`
/// keys by the resource's `TypeId`; composed layers key by their own
/// identity so distinct `from_resource(T, ...)` calls for the same `T` under
/// different configurations still dedupe against themselves but not each
/// other.
pub type MemoKey = u64;

/// The memo map shared across one composite [`Layer`] build. Not shared
/// across separate `build`/`build_scoped` calls.
#[derive(Clone, Default)]
pub struct Memo {
    built: Arc<Mutex<HashMap<MemoKey, Context>>>,
}

impl Memo {
    fn new() -> Self {
        Memo::default()
    }

    fn get(&self, key: MemoKey) -> Option<Context> {
        self.built.lock().expect("memo mutex poisoned").get(&key).cloned()
    }

    fn insert(&self, key: MemoKey, ctx: Context) {
        self.built.lock().expect("memo mutex poisoned").insert(key, ctx);
    }
}

type AcquireFut = Pin<Box<dyn Future<Output = Result<Context, RuntimeError>> + Send>>;
type ReleaseFut = Pin<Box<dyn Future<Output = ()> + Send>>;
type AcquireFn = dyn Fn(Context, Memo) -> AcquireFut + Send + Sync;
type ReleaseFn = dyn Fn(Context, Memo) -> ReleaseFut + Send + Sync;

static NEXT_LAYER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A composable, memoized resource builder/teardown pair.
#[derive(Clone)]
pub struct Layer {
    id: MemoKey,
    acquire: Arc<AcquireFn>,
    release: Arc<ReleaseFn>,
}

impl Layer {
    /// Builds a layer from raw acquire/release closures, each receiving the
    /// parent context (or, for release, the built context) and the
    /// in-flight memo map.
    pub fn new<Acq, AcqFut, Rel, RelFut>(acquire: Acq, release: Rel) -> Self
    where
        Acq: Fn(Context, Memo) -> AcqFut + Send + Sync + 'static,
        AcqFut: Future<Output = Result<Context, RuntimeError>> + Send + 'static,
        Rel: Fn(Context, Memo) -> RelFut + Send + Sync + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        Layer {
            id: NEXT_LAYER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            acquire: Arc::new(move |ctx, memo| Box::pin(acquire(ctx, memo)) as AcquireFut),
            release: Arc::new(move |ctx, memo| Box::pin(release(ctx, memo)) as ReleaseFut),
        }
    }

    /// Builds this layer over `parent` with a fresh, single-use memo map.
    pub async fn build(&self, parent: &Context) -> Result<Context, RuntimeError> {
        self.build_memo(parent, &Memo::new()).await
    }

    /// Builds this layer over `parent`, sharing `memo` with whatever
    /// composite build it is part of.
    pub async fn build_memo(&self, parent: &Context, memo: &Memo) -> Result<Context, RuntimeError> {
        if let Some(cached) = memo.get(self.id) {
            return Ok(cached);
        }
        let built = (self.acquire)(parent.clone(), memo.clone()).await?;
        memo.insert(self.id, built.clone());
        Ok(built)
    }

    /// Builds this layer, registering its teardown with `scope` instead of
    /// running it inline — the resource's lifetime can then outlive this
    /// one call, ending only when `scope` closes.
    pub async fn build_scoped(&self, parent: &Context, scope: &Scope) -> Result<Context, RuntimeError> {
        let memo = Memo::new();
        let ctx = self.build_memo(parent, &memo).await?;
        let release = self.release.clone();
        let ctx_for_release = ctx.clone();
        scope
            .add_finalizer(move || {
                let release = release.clone();
                let ctx = ctx_for_release.clone();
                let memo = memo.clone();
                async move {
                    release(ctx, memo).await;
                }
            })
            .await;
        Ok(ctx)
    }

    /// Tears down a context this layer built, with a fresh memo map.
    pub async fn teardown(&self, ctx: &Context) {
        self.teardown_memo(ctx, &Memo::new()).await;
    }

    /// Tears down a context this layer built, sharing `memo` with the
    /// composite build it came from.
    pub async fn teardown_memo(&self, ctx: &Context, memo: &Memo) {
        (self.release)(ctx.clone(), memo.clone()).await;
    }

    /// Sequential composition (`+`): acquire `self`, then acquire `other`
    /// over the result; teardown runs in reverse (`other` first). If
    /// `other`'s acquire fails, `self` is torn down before the error
    /// surfaces.
    #[must_use]
    pub fn and_then(self, other: Layer) -> Layer {
        let left = self.clone();
        let right = other.clone();
        let acquire_left = self.clone();
        let acquire_right = other.clone();
        Layer::new(
            move |parent, memo| {
                let left = acquire_left.clone();
                let right = acquire_right.clone();
                async move {
                    let mid = left.build_memo(&parent, &memo).await?;
                    match right.build_memo(&mid, &memo).await {
                        Ok(final_ctx) => Ok(final_ctx),
                        Err(err) => {
                            left.teardown_memo(&mid, &memo).await;
                            Err(err)
                        }
                    }
                }
            },
            move |ctx, memo| {
                let left = left.clone();
                let right = right.clone();
                async move {
                    right.teardown_memo(&ctx, &memo).await;
                    left.teardown_memo(&ctx, &memo).await;
                }
            },
        )
    }

    /// Parallel composition (`⊕`): acquire both sides concurrently and
    /// merge the resulting contexts, the right side's bindings winning on
    /// key collision (later-added wins — see `SPEC_FULL.md` §9, Open
    /// Question 1). On one-sided failure, the successful side is torn down
    /// before the error surfaces.
    #[must_use]
    pub fn or(self, other: Layer) -> Layer {
        let left = self.clone();
        let right = other.clone();
        let acquire_left = self.clone();
        let acquire_right = other.clone();
        Layer::new(
            move |parent, memo| {
                let left = acquire_left.clone();
                let right = acquire_right.clone();
                async move {
                    let left_fut = left.build_memo(&parent, &memo);
                    let right_fut = right.build_memo(&parent, &memo);
                    match tokio::join!(left_fut, right_fut) {
                        (Ok(l), Ok(r)) => Ok(l.merged_with(&r)),
                        (Err(e), Ok(r)) => {
                            right.teardown_memo(&r, &memo).await;
                            Err(e)
                        }
                        (Ok(l), Err(e)) => {
                            left.teardown_memo(&l, &memo).await;
                            Err(e)
                        }
                        (Err(e), Err(_)) => Err(e),
                    }
                }
            },
            move |ctx, memo| {
                let left = left.clone();
                let right = right.clone();
                async move {
                    tokio::join!(
                        left.teardown_memo(&ctx, &memo),
                        right.teardown_memo(&ctx, &memo)
                    );
                }
            },
        )
    }
}

/// Builds a `Layer` that registers a single resource of type `T` in the
/// `Context`, built by `mk` and torn down by `close`. Deduplicates via the
/// memo map keyed by `T`'s `TypeId` so the same leaf resource appearing
/// under multiple composite paths is built once.
pub fn from_resource<T, Mk, MkFut, Close, CloseFut>(mk: Mk, close: Close) -> Layer
where
    T: Send + Sync + 'static,
    Mk: Fn(Context) -> MkFut + Send + Sync + 'static,
    MkFut: Future<Output = Result<T, RuntimeError>> + Send + 'static,
    Close: Fn(Arc<T>) -> CloseFut + Send + Sync + 'static,
    CloseFut: Future<Output = ()> + Send + 'static,
{
    let mk = Arc::new(mk);
    let close = Arc::new(close);
    Layer::new(
        move |parent, _memo| {
            let mk = mk.clone();
            async move {
                let inst = mk(parent.clone()).await?;
                Ok(parent.add(inst))
            }
        },
        move |ctx, _memo| {
            let close = close.clone();
            async move {
                if let Some(inst) = ctx.try_get::<T>() {
                    close(inst).await;
                }
            }
        },
    )
}

/// Builds a `Layer` that simply binds a pre-built `value` into the
/// `Context`, with no teardown action. Useful for providing test doubles
/// or already-constructed services (`Layer::service(MyConfig { .. })`).
pub fn service<T>(value: T) -> Layer
where
    T: Send + Sync + 'static,
{
    let value = Arc::new(value);
    Layer::new(
        move |parent, _memo| {
            let value = value.clone();
            async move { Ok(parent.add_arc(value)) }
        },
        move |_ctx, _memo| async move {},
    )
}
