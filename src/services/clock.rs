//! Virtualizable wall-clock service.
//!
//! `Clock` is a thin handle over a pluggable backend: [`ClockLayer`] installs
//! a real, monotonic-time clock; [`TestClockLayer`] installs a logical clock
//! that advances on `sleep` without actually waiting, so schedule/retry/
//! timeout tests run instantly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cause::Exit;
use crate::context::Context;
use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::layer::{from_resource, Layer};

#[async_trait]
trait ClockBackend: Send + Sync {
    async fn sleep(&self, d: Duration);
    fn now(&self) -> f64;
}

struct RealClock {
    start: Instant,
}

#[async_trait]
impl ClockBackend for RealClock {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// A logical clock whose `now()` only moves when `sleep` is called, storing
/// elapsed nanoseconds as an atomic so `now`/`sleep` need no lock.
struct TestClockBackend {
    nanos: AtomicU64,
}

#[async_trait]
impl ClockBackend for TestClockBackend {
    async fn sleep(&self, d: Duration) {
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
        // Yield once so concurrently-scheduled fibers get a chance to run,
        // matching the source's `await asyncio.sleep(0)`.
        tokio::task::yield_now().await;
    }

    fn now(&self) -> f64 {
        self.nanos.load(Ordering::SeqCst) as f64 / 1_000_000_000.0
    }
}

/// The clock service: `sleep` and `now`, backed by either a real or a
/// virtual-time implementation depending on which layer built it.
pub struct Clock {
    backend: Arc<dyn ClockBackend>,
}

impl Clock {
    /// Suspends for `seconds` (clamped to non-negative) against whichever
    /// backend is installed.
    pub async fn sleep(&self, seconds: f64) {
        self.backend.sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    }

    /// Seconds since this clock's epoch.
    pub fn now(&self) -> f64 {
        self.backend.now()
    }
}

/// Builds the real-time `Clock`, backed by `tokio::time` and a monotonic
/// start instant.
pub fn clock_layer() -> Layer {
    from_resource::<Clock, _, _, _, _>(
        |_parent: Context| async move {
            Ok::<Clock, RuntimeError>(Clock {
                backend: Arc::new(RealClock { start: Instant::now() }),
            })
        },
        |_clock: Arc<Clock>| async move {},
    )
}

/// Builds a `Clock` whose time only advances when something calls `sleep`
/// through it — real time never elapses, so retry/backoff/timeout tests
/// driven by this clock run as fast as the executor can poll them.
pub fn test_clock_layer(start_seconds: f64) -> Layer {
    let start_nanos = (start_seconds.max(0.0) * 1_000_000_000.0) as u64;
    from_resource::<Clock, _, _, _, _>(
        move |_parent: Context| async move {
            Ok::<Clock, RuntimeError>(Clock {
                backend: Arc::new(TestClockBackend {
                    nanos: AtomicU64::new(start_nanos),
                }),
            })
        },
        |_clock: Arc<Clock>| async move {},
    )
}

/// Suspends the calling fiber for `seconds`, via the `Clock` bound in the
/// running `Context`.
///
/// # Errors
///
/// `Die`s with [`RuntimeError::MissingService`] if no `Clock` is bound.
pub fn sleep<E: Send + 'static>(seconds: f64) -> Effect<E, ()> {
    Effect::new(move |ctx: Context| async move {
        match ctx.get::<Clock>() {
            Ok(clock) => {
                clock.sleep(seconds).await;
                Exit::Success(())
            }
            Err(err) => Exit::Failure(crate::cause::Cause::die(crate::error::Defect::new(err))),
        }
    })
}

/// The current time (in seconds) reported by the `Clock` bound in the
/// running `Context`.
pub fn current_time<E: Send + 'static>() -> Effect<E, f64> {
    Effect::new(move |ctx: Context| async move {
        match ctx.get::<Clock>() {
            Ok(clock) => Exit::Success(clock.now()),
            Err(err) => Exit::Failure(crate::cause::Cause::die(crate::error::Defect::new(err))),
        }
    })
}
