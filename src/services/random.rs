//! Virtualizable randomness service.
//!
//! `Random` wraps a seedable RNG behind a `Mutex` (the generator itself is
//! `!Sync`): [`RandomLayer`] seeds from entropy, [`TestRandomLayer`] seeds
//! deterministically so randomized schedules and test fixtures reproduce.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::cause::{Cause, Exit};
use crate::context::Context;
use crate::effect::Effect;
use crate::error::{Defect, RuntimeError};
use crate::layer::{from_resource, Layer};

/// The randomness service, bound in a `Context` via [`random_layer`] or
/// [`test_random_layer`].
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    /// A value uniformly distributed in `[0, 1)`.
    pub async fn next_float(&self) -> f64 {
        self.rng.lock().await.gen::<f64>()
    }

    /// A value uniformly distributed in `[0, bound)`.
    ///
    /// # Panics
    ///
    /// If `bound == 0`.
    pub async fn next_int(&self, bound: u64) -> u64 {
        assert!(bound > 0, "bound must be > 0");
        self.rng.lock().await.gen_range(0..bound)
    }

    /// Picks a uniformly random element from `seq`.
    ///
    /// # Panics
    ///
    /// If `seq` is empty.
    pub async fn choice<'a, T>(&self, seq: &'a [T]) -> &'a T {
        assert!(!seq.is_empty(), "empty sequence");
        let idx = self.next_int(seq.len() as u64).await as usize;
        &seq[idx]
    }
}

/// Builds a `Random` seeded from OS entropy.
pub fn random_layer() -> Layer {
    from_resource::<Random, _, _, _, _>(
        |_parent: Context| async move {
            Ok::<Random, RuntimeError>(Random {
                rng: Mutex::new(StdRng::from_entropy()),
            })
        },
        |_r: Arc<Random>| async move {},
    )
}

/// Builds a `Random` seeded deterministically from `seed` — the same seed
/// always produces the same sequence of draws.
pub fn test_random_layer(seed: u64) -> Layer {
    from_resource::<Random, _, _, _, _>(
        move |_parent: Context| async move {
            Ok::<Random, RuntimeError>(Random {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            })
        },
        |_r: Arc<Random>| async move {},
    )
}

/// Draws a value in `[0, bound)` from the `Random` bound in the running
/// `Context`.
///
/// # Errors
///
/// `Die`s with [`RuntimeError::MissingService`] if no `Random` is bound.
pub fn random_int<E: Send + 'static>(bound: u64) -> Effect<E, u64> {
    Effect::new(move |ctx: Context| async move {
        match ctx.get::<Random>() {
            Ok(r) => Exit::Success(r.next_int(bound).await),
            Err(err) => Exit::Failure(Cause::die(Defect::new(err))),
        }
    })
}

/// Draws a value in `[0, 1)` from the `Random` bound in the running
/// `Context`.
pub fn random_float<E: Send + 'static>() -> Effect<E, f64> {
    Effect::new(move |ctx: Context| async move {
        match ctx.get::<Random>() {
            Ok(r) => Exit::Success(r.next_float().await),
            Err(err) => Exit::Failure(Cause::die(Defect::new(err))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_seed_same_sequence() {
        let a = test_random_layer(7).build(&Context::new()).await.unwrap();
        let b = test_random_layer(7).build(&Context::new()).await.unwrap();
        let ra = a.get::<Random>().unwrap();
        let rb = b.get::<Random>().unwrap();
        for _ in 0..5 {
            assert_eq!(ra.next_int(1000).await, rb.next_int(1000).await);
        }
    }

    #[tokio::test]
    async fn random_int_effect_reads_installed_service() {
        let ctx = test_random_layer(1).build(&Context::new()).await.unwrap();
        let v = random_int::<()>(10).run(ctx).await;
        assert!(matches!(v, Exit::Success(n) if n < 10));
    }

    #[tokio::test]
    #[should_panic(expected = "bound must be > 0")]
    async fn zero_bound_panics() {
        let ctx = test_random_layer(1).build(&Context::new()).await.unwrap();
        let r = ctx.get::<Random>().unwrap();
        r.next_int(0).await;
    }
}
