//! Immutable, type-keyed service container.
//!
//! A [`Context`] is the environment an [`Effect`](crate::effect::Effect) is
//! interpreted against. It carries at most one instance per concrete type;
//! `add` never mutates an existing `Context` in place, it returns a new one
//! sharing the unchanged entries.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RuntimeError;

type AnyService = Arc<dyn Any + Send + Sync>;

/// An immutable mapping from a service's type to its instance.
///
/// ```
/// use effect_rail::context::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct Greeting(String);
///
/// let ctx = Context::new().add(Greeting("hello".into()));
/// assert_eq!(&*ctx.get::<Greeting>().unwrap(), &Greeting("hello".into()));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<TypeId, AnyService>>,
}

impl Context {
    /// An empty context with no registered services.
    pub fn new() -> Self {
        Context {
            values: Arc::new(HashMap::new()),
        }
    }

    /// Returns a new `Context` with `value` bound to its type, leaving
    /// `self` unchanged. A prior binding for the same type is shadowed (the
    /// new context no longer returns it from `get`).
    #[must_use]
    pub fn add<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value) as AnyService);
        Context {
            values: Arc::new(values),
        }
    }

    /// Like [`add`](Self::add), but for a value that is already behind an
    /// `Arc` — avoids wrapping an `Arc<T>` a second time.
    #[must_use]
    pub(crate) fn add_arc<T: Send + Sync + 'static>(&self, value: Arc<T>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), value as AnyService);
        Context {
            values: Arc::new(values),
        }
    }

    /// Looks up the service bound to type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingService`] if no value of type `T` was
    /// ever added. Interpreter call sites convert this into a
    /// [`Cause::Die`](crate::cause::Cause::Die) — a missing service is a
    /// wiring bug, not a recoverable domain failure.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, RuntimeError> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .map(|v| v.downcast::<T>().expect("TypeId mapping is exact"))
            .ok_or_else(RuntimeError::missing_service::<T>)
    }

    /// Like [`get`](Self::get) but returns `None` instead of an error,
    /// useful for optional services (`Logger`, `Metrics`, `Tracer`).
    pub fn try_get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get::<T>().ok()
    }

    /// True if a service of type `T` has been bound.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Merges `other`'s bindings onto `self`, with `other`'s entries
    /// winning on key collision (later-added wins).
    ///
    /// Used by [`Layer::or`](crate::layer::Layer::or) to implement the
    /// parallel-composition merge.
    #[must_use]
    pub(crate) fn merged_with(&self, other: &Context) -> Self {
        let mut values = (*self.values).clone();
        for (k, v) in other.values.iter() {
            values.insert(*k, v.clone());
        }
        Context {
            values: Arc::new(values),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_copy_on_write() {
        let base = Context::new().add(1_i32);
        let extended = base.add("hi");
        assert!(base.get::<&str>().is_err());
        assert_eq!(*extended.get::<i32>().unwrap(), 1);
        assert_eq!(*extended.get::<&str>().unwrap(), "hi");
    }

    #[test]
    fn later_add_shadows_earlier() {
        let ctx = Context::new().add(1_i32).add(2_i32);
        assert_eq!(*ctx.get::<i32>().unwrap(), 2);
    }

    #[test]
    fn missing_service_is_an_error() {
        let ctx = Context::new();
        assert!(matches!(
            ctx.get::<i32>(),
            Err(RuntimeError::MissingService { .. })
        ));
    }

    #[test]
    fn merge_prefers_right_side() {
        let left = Context::new().add(1_i32).add("left");
        let right = Context::new().add(2_i32);
        let merged = left.merged_with(&right);
        assert_eq!(*merged.get::<i32>().unwrap(), 2);
        assert_eq!(*merged.get::<&str>().unwrap(), "left");
    }
}
