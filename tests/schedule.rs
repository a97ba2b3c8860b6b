//! Retry/repeat policies, covering S7: attempt counts for `recurs`, and
//! monotonically non-decreasing delays (until capped) for `exponential`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use effect_rail::cause::{Cause, Exit};
use effect_rail::effect::Effect;
use effect_rail::schedule::Schedule;

#[tokio::test]
async fn recurs_caps_total_attempts_at_n_plus_one() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let eff: Effect<String, i32> = Effect::sync(move || {
        a.fetch_add(1, Ordering::SeqCst);
    })
    .flat_map(|_| Effect::<String, i32>::fail("boom".to_string()))
    .retry(Schedule::<u32, String, u32>::recurs(3));

    let exit = eff.run_default().await;
    assert!(matches!(exit, Exit::Failure(Cause::Fail(ref e, _)) if e == "boom"));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[test]
fn exponential_delays_grow_and_cap() {
    let s: Schedule<u32, (), Duration> =
        Schedule::exponential(Duration::from_millis(10), Some(Duration::from_millis(35)));
    let (_, d0, _) = s.step(&());
    let (_, d1, _) = s.step(&());
    let (_, d2, _) = s.step(&());
    let (_, d3, _) = s.step(&());
    assert_eq!(d0, Duration::from_millis(10));
    assert_eq!(d1, Duration::from_millis(20));
    assert_eq!(d2, Duration::from_millis(35));
    assert_eq!(d3, Duration::from_millis(35));
    assert!(d0 <= d1 && d1 <= d2 && d2 <= d3);
}

#[test]
fn spaced_never_stops_and_delay_is_constant() {
    let s: Schedule<u32, (), u32> = Schedule::spaced(Duration::from_millis(7));
    for _ in 0..20 {
        let (cont, delay, _) = s.step(&());
        assert!(cont);
        assert_eq!(delay, Duration::from_millis(7));
    }
}

#[test]
fn reset_rewinds_recurs_to_its_initial_budget() {
    let s: Schedule<u32, (), u32> = Schedule::recurs(1);
    assert!(s.step(&()).0);
    assert!(!s.step(&()).0);
    s.reset();
    assert!(s.step(&()).0);
}

#[tokio::test]
async fn repeat_stops_when_schedule_says_so() {
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let eff: Effect<String, i32> = Effect::sync(move || {
        r.fetch_add(1, Ordering::SeqCst) as i32
    })
    .repeat(Schedule::<u32, i32, u32>::recurs(2));

    let exit = eff.run_default().await;
    assert!(matches!(exit, Exit::Success(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn jittered_delay_stays_within_the_configured_factor_range() {
    let base: Schedule<u32, (), u32> = Schedule::spaced(Duration::from_millis(100));
    let jittered = base.jittered(0.5, 1.5);
    for _ in 0..50 {
        let (_, delay, _) = jittered.step(&());
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }
}
