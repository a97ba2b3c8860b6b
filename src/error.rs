//! Internal failure modes of the runtime itself.
//!
//! A [`RuntimeError`] is never a typed `Fail` inside user code: a missing
//! service, a send on a closed [`Queue`](crate::queue::Queue), or a layer
//! that fails to build are programmer errors, not domain failures, so the
//! interpreter always lifts them into [`Cause::Die`](crate::cause::Cause::Die).

use std::any::type_name;
use std::fmt;

/// Failure modes raised by the runtime's own bookkeeping rather than by
/// user-supplied effects.
///
/// `RuntimeError` is marked `#[non_exhaustive]`: new internal failure kinds
/// may be added without it being a breaking change for matches that already
/// carry a wildcard arm.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// `Context::get::<T>()` was called but no value of type `T` was ever
    /// added to the context.
    #[error("missing service: {type_name}")]
    MissingService {
        /// The human-readable name of the type that was looked up.
        type_name: &'static str,
    },
    /// A `send` was attempted on a [`Queue`](crate::queue::Queue) or
    /// [`Channel`](crate::channel::Channel) after `close()`.
    #[error("send on closed queue")]
    SendOnClosed,
    /// A `receive` observed a closed, drained queue.
    #[error("receive on closed, empty queue")]
    ReceiveOnClosed,
    /// A [`Hub`](crate::hub::Hub) refused a subscription after `close()`.
    #[error("subscribe on closed hub")]
    SubscribeOnClosed,
    /// A [`Layer`](crate::layer::Layer) build failed while acquiring a
    /// resource; the inner message is the acquire function's own error
    /// rendering.
    #[error("layer build failed: {0}")]
    LayerBuild(String),
    /// A [`Deferred`](crate::refs::Deferred) was completed a second time.
    #[error("deferred already completed")]
    DeferredAlreadySet,
}

impl RuntimeError {
    /// Builds a [`RuntimeError::MissingService`] for type `T`.
    pub fn missing_service<T>() -> Self {
        RuntimeError::MissingService {
            type_name: type_name::<T>(),
        }
    }
}

/// A boxed, type-erased defect carried by [`Cause::Die`](crate::cause::Cause::Die).
///
/// Wraps `dyn Error + Send + Sync` rather than an arbitrary payload: the
/// interpreter needs `Display`/`Error` to render causes, and `Send + Sync`
/// to cross fiber boundaries.
#[derive(Clone)]
pub struct Defect(std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Defect {
    /// Wraps any `std::error::Error` as a defect.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Defect(std::sync::Arc::new(err))
    }

    /// Wraps a panic payload caught via [`std::panic::catch_unwind`] or a
    /// joined, panicked [`tokio::task::JoinHandle`].
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "fiber panicked with a non-string payload".to_string()
        };
        Defect::new(PanicDefect(msg))
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.0)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct PanicDefect(String);
