//! Stateful retry/repeat policies.
//!
//! A [`Schedule`] is a state machine: given its current state and an input
//! (the failure just raised, for `retry`; the value just produced, for
//! `repeat`), it decides whether to continue, how long to wait before the
//! next attempt, and what state to carry forward. `reset` rewinds it to its
//! initial state — [`Effect::retry`](crate::effect::Effect::retry) and
//! [`Effect::repeat`](crate::effect::Effect::repeat) both reset before their
//! first step so a schedule value can be reused across many calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

type StepFn<S, In, Out> = dyn Fn(&S, &In) -> Step<S, Out> + Send + Sync;

/// One transition of a [`Schedule`]: whether to continue, the delay before
/// the next attempt, the output value for this step, and the next state.
pub struct Step<S, Out> {
    pub continue_: bool,
    pub delay: Duration,
    pub out: Out,
    pub state: S,
}

/// A stateful `(state, input) -> (continue, delay, out, next_state)`
/// function with a resettable initial state.
///
/// Cloning a `Schedule` shares its current state (an `Arc<Mutex<S>>`) —
/// cloning is how [`Effect::retry`](crate::effect::Effect::retry) captures a
/// schedule into its re-invokable closure, and every invocation of that
/// closure must observe (and mutate) the same running state.
pub struct Schedule<S, In, Out> {
    initial: S,
    state: Arc<Mutex<S>>,
    step_fn: Arc<StepFn<S, In, Out>>,
}

impl<S, In, Out> Clone for Schedule<S, In, Out>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Schedule {
            initial: self.initial.clone(),
            state: self.state.clone(),
            step_fn: self.step_fn.clone(),
        }
    }
}

impl<S, In, Out> Schedule<S, In, Out>
where
    S: Clone + Send + Sync + 'static,
{
    /// Builds a schedule from an initial state and a pure step function.
    pub fn new<F>(initial: S, step_fn: F) -> Self
    where
        F: Fn(&S, &In) -> Step<S, Out> + Send + Sync + 'static,
    {
        Schedule {
            state: Arc::new(Mutex::new(initial.clone())),
            initial,
            step_fn: Arc::new(step_fn),
        }
    }

    /// Rewinds the running state back to the schedule's initial state.
    pub fn reset(&self) {
        *self.state.lock().expect("schedule mutex poisoned") = self.initial.clone();
    }

    /// Advances the schedule by one step, returning `(continue, delay, out)`
    /// and updating the running state in place.
    pub fn step(&self, input: &In) -> (bool, Duration, Out) {
        let mut guard = self.state.lock().expect("schedule mutex poisoned");
        let next = (self.step_fn)(&guard, input);
        *guard = next.state;
        (next.continue_, next.delay, next.out)
    }
}

impl<In> Schedule<u32, In, u32> {
    /// Continues for up to `n` more attempts after the first, with zero
    /// delay. State counts attempts remaining.
    pub fn recurs(n: u32) -> Self {
        Schedule::new(n, |state: &u32, _input: &In| {
            if *state == 0 {
                Step {
                    continue_: false,
                    delay: Duration::ZERO,
                    out: 0,
                    state: 0,
                }
            } else {
                Step {
                    continue_: true,
                    delay: Duration::ZERO,
                    out: *state,
                    state: state - 1,
                }
            }
        })
    }

    /// Unbounded, constant delay between attempts. State counts attempts
    /// made so far.
    pub fn spaced(interval: Duration) -> Self {
        Schedule::new(0, move |state: &u32, _input: &In| Step {
            continue_: true,
            delay: interval,
            out: *state,
            state: state + 1,
        })
    }
}

impl<In> Schedule<u32, In, Duration> {
    /// Unbounded, `delay = base * 2^attempt`, optionally capped at
    /// `max_delay`. State counts attempts made so far.
    pub fn exponential(base: Duration, max_delay: Option<Duration>) -> Self {
        Schedule::new(0, move |state: &u32, _input: &In| {
            let factor = 1u32.checked_shl(*state).unwrap_or(u32::MAX);
            let mut delay = base.saturating_mul(factor);
            if let Some(cap) = max_delay {
                delay = delay.min(cap);
            }
            Step {
                continue_: true,
                delay,
                out: delay,
                state: state + 1,
            }
        })
    }
}

impl<S, In, Out> Schedule<S, In, Out>
where
    S: Clone + Send + Sync + 'static,
    In: 'static,
    Out: Send + 'static,
{
    /// Decorates this schedule, multiplying every delay it produces by a
    /// uniform random factor in `[min_factor, max_factor]`.
    pub fn jittered(self, min_factor: f64, max_factor: f64) -> Schedule<S, In, Out>
    where
        Out: Clone,
    {
        let inner_state = self.state.clone();
        let inner_initial = self.initial.clone();
        let inner_step = self.step_fn.clone();
        Schedule {
            initial: inner_initial,
            state: inner_state,
            step_fn: Arc::new(move |state: &S, input: &In| {
                let inner = (inner_step)(state, input);
                let factor = rand::thread_rng().gen_range(min_factor..=max_factor);
                let scaled = inner.delay.mul_f64(factor.max(0.0));
                Step {
                    continue_: inner.continue_,
                    delay: scaled,
                    out: inner.out,
                    state: inner.state,
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurs_counts_down_then_stops() {
        let s: Schedule<u32, (), u32> = Schedule::recurs(2);
        let (c1, _, _) = s.step(&());
        let (c2, _, _) = s.step(&());
        let (c3, _, _) = s.step(&());
        assert!(c1 && c2);
        assert!(!c3);
    }

    #[test]
    fn reset_rewinds_state() {
        let s: Schedule<u32, (), u32> = Schedule::recurs(1);
        s.step(&());
        s.step(&());
        s.reset();
        let (cont, _, _) = s.step(&());
        assert!(cont);
    }

    #[test]
    fn exponential_is_monotonic_until_capped() {
        let s: Schedule<u32, (), Duration> =
            Schedule::exponential(Duration::from_millis(10), Some(Duration::from_millis(35)));
        let (_, d0, _) = s.step(&());
        let (_, d1, _) = s.step(&());
        let (_, d2, _) = s.step(&());
        assert_eq!(d0, Duration::from_millis(10));
        assert_eq!(d1, Duration::from_millis(20));
        assert_eq!(d2, Duration::from_millis(35));
    }

    #[test]
    fn spaced_is_unbounded_with_constant_delay() {
        let s: Schedule<u32, (), u32> = Schedule::spaced(Duration::from_millis(5));
        for _ in 0..5 {
            let (cont, delay, _) = s.step(&());
            assert!(cont);
            assert_eq!(delay, Duration::from_millis(5));
        }
    }
}
