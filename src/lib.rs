//! A ZIO-flavored effect system: lazy, composable `Effect` values with
//! explicit success/failure channels, structured concurrency, resource
//! safety, and backpressured dataflow, built on `tokio`.
//!
//! `effect-rail` is organized around a small set of tightly-coupled
//! abstractions, leaves first:
//! 1. **Failure & completion** – [`cause`] (`Cause`/`Exit`), the structured
//!    failure tree every effect's fail/die/interrupt path materializes into.
//! 2. **Environment & resources** – [`context`], [`scope`], and [`layer`]:
//!    an immutable type-keyed service map, a LIFO finalizer stack, and a
//!    memoized builder/teardown pair over the two.
//! 3. **The interpreter** – [`effect`]: `Effect<E, A>`, its sequential and
//!    parallel combinators, and resource-safe bracketing.
//! 4. **Structured concurrency** – [`fiber`]: `Fiber`/`Runtime`/`Supervisor`,
//!    cooperative interruption, and task-local inheritance across `fork`.
//! 5. **Coordination primitives** – [`queue`], [`hub`], [`channel`], and
//!    [`refs`] (`Ref`/`Deferred`/`FiberRef`).
//! 6. **Policies** – [`schedule`]: stateful retry/repeat policies.
//! 7. **Dataflow** – [`stream`]: pull-based, backpressured `Stream`/`Sink`
//!    built on top of `Queue`.
//! 8. **Ambient services** – [`services`]: `Clock`/`Random` (always
//!    virtualizable) and optional `Logger`/`Metrics`/`Tracer`, tied together
//!    by [`services::instrument`].
//!
//! # Examples
//!
//! ## Sequencing and recovery
//!
//! ```
//! use effect_rail::effect::Effect;
//! use effect_rail::cause::Exit;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let eff: Effect<String, i32> = Effect::succeed(2)
//!     .map(|x| x + 3)
//!     .flat_map(|y| Effect::succeed(y * 2));
//! assert!(matches!(eff.run_default().await, Exit::Success(10)));
//!
//! let recovered: Effect<String, String> = Effect::fail("boom".to_string())
//!     .catch_all(|e| Effect::succeed(format!("handled:{e}")));
//! assert!(matches!(recovered.run_default().await, Exit::Success(s) if s == "handled:boom"));
//! # }
//! ```
//!
//! ## Bounded concurrency
//!
//! ```
//! use effect_rail::effect::{for_each_par, Effect};
//! use effect_rail::cause::Exit;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let eff = for_each_par((0..5).collect(), |i: i32| Effect::<String, i32>::succeed(i * 2), 2);
//! assert!(matches!(eff.run_default().await, Exit::Success(v) if v == vec![0, 2, 4, 6, 8]));
//! # }
//! ```
//!
//! ## Streaming
//!
//! ```
//! use effect_rail::stream::Stream;
//! use effect_rail::stream::sink::fold;
//! use effect_rail::cause::Exit;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let s: Stream<i32, String> = Stream::from_iterable(vec![0, 1, 2, 3, 4])
//!     .map(|x| x + 1)
//!     .map(|x| x * x);
//! let exit = s.run(fold(Vec::new(), |mut acc, x| { acc.push(x); acc })).run_default().await;
//! assert!(matches!(exit, Exit::Success(v) if v == vec![1, 4, 9, 16, 25]));
//! # }
//! ```

/// The `Backend` trait abstracting the reactor a `Runtime` drives fibers
/// through, plus its `TokioBackend` default and `RuntimeConfig`.
pub mod backend;
/// Structured failure tree (`Cause`) and fiber completion record (`Exit`).
pub mod cause;
/// Unbounded or small-bounded rendezvous primitive used by pipeline stages.
pub mod channel;
/// Immutable, type-keyed service container.
pub mod context;
/// Lazy, re-invokable computations with explicit success/failure channels.
pub mod effect;
/// Internal failure modes of the runtime itself.
pub mod error;
/// Structured concurrency: fibers, the runtime, and interruption.
pub mod fiber;
/// Multi-subscriber broadcast built from per-subscriber queues.
pub mod hub;
/// Composable, memoized resource builders over `Context`.
pub mod layer;
/// Bounded FIFO queue with a closed state.
pub mod queue;
/// Atomic cell, one-shot promise, and task-local variable.
pub mod refs;
/// Stateful retry/repeat policies.
pub mod schedule;
/// LIFO finalizer stack with idempotent close.
pub mod scope;
/// Virtualizable and optional services bound into a `Context`.
pub mod services;
/// Pull-based, backpressured dataflow with a parallel error channel.
pub mod stream;

/// The commonly-needed types for a `use effect_rail::prelude::*` import:
/// the interpreter, its failure/completion records, the environment types,
/// and structured concurrency. Service contracts, `Stream`/`Sink`, and the
/// coordination primitives are left out — pull those in from their own
/// modules, the way `but212-error-rail`'s own prelude covers only its
/// most-used core types rather than every submodule.
pub mod prelude {
    pub use crate::cause::{Cause, Exit};
    pub use crate::context::Context;
    pub use crate::effect::{acquire_release, for_each_par, race, zip_par, Effect};
    pub use crate::fiber::{Fiber, Runtime, Supervisor};
    pub use crate::layer::Layer;
    pub use crate::scope::Scope;
}
