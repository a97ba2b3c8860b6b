//! Virtualizable and optional services bound into a running [`Context`](crate::context::Context).
//!
//! `clock`/`random` are always on (every effect system needs a virtualizable
//! notion of time and chance to test retry/backoff/jitter deterministically);
//! `logger`/`metrics`/`tracer` are optional but ambient the moment any layer
//! binds one, picked up automatically by [`instrument`](instrument::instrument)
//! and the combinators that log a swallowed finalizer failure.

pub mod clock;
pub mod exporter;
pub mod instrument;
pub mod logger;
pub mod metrics;
pub mod random;
pub mod tracer;
