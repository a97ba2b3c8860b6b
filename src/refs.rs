//! Atomic cell, one-shot promise, and task-local variable.
//!
//! [`Ref<T>`] and [`Deferred<T>`] are plain shared-mutable-state primitives
//! guarded by a `tokio::sync::Mutex`/`Notify` pair. [`FiberRef<T>`] is
//! different in kind: its value lives in a task-local store that
//! [`Runtime::fork`](crate::fiber::Runtime::fork) snapshots and re-installs
//! in the child fiber at fork time (copy-on-write — a child's subsequent
//! `set`/`locally` never affects the parent, and vice versa).

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, Notify};

use crate::error::RuntimeError;

/// A single mutable cell, serialized by an internal lock.
pub struct Ref<T> {
    value: Mutex<T>,
}

impl<T: Send> Ref<T> {
    /// A fresh cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Ref {
            value: Mutex::new(initial),
        }
    }

    /// Reads the current value.
    pub async fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.lock().await.clone()
    }

    /// Overwrites the current value.
    pub async fn set(&self, v: T) {
        *self.value.lock().await = v;
    }

    /// Replaces the value with `f(old)`, returning the new value.
    pub async fn update<F>(&self, f: F) -> T
    where
        F: FnOnce(T) -> T,
        T: Clone,
    {
        let mut guard = self.value.lock().await;
        let updated = f(guard.clone());
        *guard = updated.clone();
        updated
    }

    /// Replaces the value with the second element of `f(old)`, returning the
    /// first element.
    pub async fn modify<R, F>(&self, f: F) -> R
    where
        F: FnOnce(T) -> (R, T),
        T: Clone,
    {
        let mut guard = self.value.lock().await;
        let (out, new_v) = f(guard.clone());
        *guard = new_v;
        out
    }
}

struct DeferredState<T> {
    value: Option<Result<T, RuntimeError>>,
}

/// A single-assignment future: at most one of [`try_succeed`](Self::try_succeed)
/// / [`try_fail`](Self::try_fail) wins; every [`await_`](Self::await_) call
/// observes that same outcome.
pub struct Deferred<T> {
    state: Mutex<DeferredState<T>>,
    notify: Notify,
}

impl<T: Clone + Send> Deferred<T> {
    /// A fresh, uncompleted promise.
    pub fn new() -> Self {
        Deferred {
            state: Mutex::new(DeferredState { value: None }),
            notify: Notify::new(),
        }
    }

    /// True once completed (by either success or failure).
    pub async fn done(&self) -> bool {
        self.state.lock().await.value.is_some()
    }

    /// Waits for completion, returning the winning outcome.
    pub async fn await_(&self) -> Result<T, RuntimeError> {
        loop {
            {
                let guard = self.state.lock().await;
                if let Some(v) = &guard.value {
                    return v.clone();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Attempts to complete with a success value; `false` if already
    /// completed.
    pub async fn try_succeed(&self, value: T) -> bool {
        let mut guard = self.state.lock().await;
        if guard.value.is_some() {
            return false;
        }
        guard.value = Some(Ok(value));
        self.notify.notify_waiters();
        true
    }

    /// Like [`try_succeed`](Self::try_succeed) but panics if already
    /// completed — mirrors the source's `succeed`, which raises rather than
    /// silently dropping a double-completion.
    pub async fn succeed(&self, value: T) {
        assert!(
            self.try_succeed(value).await,
            "deferred already completed"
        );
    }

    /// Attempts to complete with a failure; `false` if already completed.
    pub async fn try_fail(&self, err: RuntimeError) -> bool {
        let mut guard = self.state.lock().await;
        if guard.value.is_some() {
            return false;
        }
        guard.value = Some(Err(err));
        self.notify.notify_waiters();
        true
    }

    /// Like [`try_fail`](Self::try_fail) but panics if already completed.
    pub async fn fail(&self, err: RuntimeError) {
        assert!(self.try_fail(err).await, "deferred already completed");
    }
}

impl<T: Clone + Send> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

// --- FiberRef: task-local, fork-inherited variables ---

type AnySendSync = dyn Any + Send + Sync;

tokio::task_local! {
    static TASK_LOCALS: StdMutex<HashMap<u64, Arc<AnySendSync>>>;
}

static NEXT_FIBER_REF_ID: AtomicU64 = AtomicU64::new(1);

/// A task-local variable inherited by child fibers at fork time
/// (copy-on-write: the child gets its own independent slot seeded with the
/// parent's current value).
pub struct FiberRef<T> {
    id: u64,
    initial: Arc<T>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + Sync + 'static> FiberRef<T> {
    /// A fresh `FiberRef` whose value, absent any `set`/`locally`, is
    /// `initial`.
    pub fn new(initial: T) -> Self {
        FiberRef {
            id: NEXT_FIBER_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial: Arc::new(initial),
            _marker: std::marker::PhantomData,
        }
    }

    fn read_from_map(&self, map: &HashMap<u64, Arc<AnySendSync>>) -> Arc<T> {
        match map.get(&self.id) {
            Some(v) => v.clone().downcast::<T>().expect("FiberRef type is stable per id"),
            None => self.initial.clone(),
        }
    }

    /// The current fiber's value for this ref, or the initial value if
    /// unset or outside any task-local scope.
    pub fn get(&self) -> Arc<T> {
        TASK_LOCALS
            .try_with(|m| self.read_from_map(&m.lock().expect("task local mutex poisoned")))
            .unwrap_or_else(|_| self.initial.clone())
    }

    /// Sets this fiber's value for this ref. A no-op outside any task-local
    /// scope (there is nowhere to store it).
    pub fn set(&self, value: T) {
        let _ = TASK_LOCALS.try_with(|m| {
            m.lock()
                .expect("task local mutex poisoned")
                .insert(self.id, Arc::new(value) as Arc<AnySendSync>);
        });
    }

    /// Runs `fut` with this ref temporarily set to `value`, restoring the
    /// prior value (or absence of one) afterward.
    pub async fn locally<Fut, R>(&self, value: T, fut: Fut) -> R
    where
        Fut: Future<Output = R>,
    {
        let previous = TASK_LOCALS.try_with(|m| m.lock().expect("poisoned").get(&self.id).cloned());
        self.set(value);
        let result = fut.await;
        match previous {
            Ok(Some(prev)) => {
                let _ = TASK_LOCALS.try_with(|m| {
                    m.lock().expect("poisoned").insert(self.id, prev);
                });
            }
            Ok(None) => {
                let _ = TASK_LOCALS.try_with(|m| {
                    m.lock().expect("poisoned").remove(&self.id);
                });
            }
            Err(_) => {}
        }
        result
    }
}

/// A snapshot of every `FiberRef` value set in the current task-local scope,
/// taken at `Runtime::fork` time so the child inherits them.
pub(crate) fn snapshot_task_locals() -> HashMap<u64, Arc<AnySendSync>> {
    TASK_LOCALS
        .try_with(|m| m.lock().expect("task local mutex poisoned").clone())
        .unwrap_or_default()
}

/// Runs `fut` inside a fresh task-local scope pre-populated with
/// `inherited` — the child fiber's copy-on-write starting point.
pub(crate) async fn with_inherited_task_locals<Fut: Future>(
    inherited: HashMap<u64, Arc<AnySendSync>>,
    fut: Fut,
) -> Fut::Output {
    TASK_LOCALS.scope(StdMutex::new(inherited), fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ref_update_returns_new_value() {
        let r = Ref::new(1);
        let updated = r.update(|v| v + 1).await;
        assert_eq!(updated, 2);
        assert_eq!(r.get().await, 2);
    }

    #[tokio::test]
    async fn deferred_second_completion_is_rejected() {
        let d: Deferred<i32> = Deferred::new();
        assert!(d.try_succeed(1).await);
        assert!(!d.try_succeed(2).await);
        assert_eq!(d.await_().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fiber_ref_locally_restores_previous_value() {
        let r: FiberRef<i32> = FiberRef::new(0);
        TASK_LOCALS
            .scope(StdMutex::new(HashMap::new()), async {
                r.set(1);
                r.locally(42, async {
                    assert_eq!(*r.get(), 42);
                })
                .await;
                assert_eq!(*r.get(), 1);
            })
            .await;
    }
}
