//! Pull-based, backpressured dataflow with a parallel error channel.
//!
//! A [`Stream<A, E>`] is, like [`Effect`](crate::effect::Effect), a
//! description, not a running computation: it wraps a closure that, given a
//! value `Queue<A>` and an error `Queue<Cause<E>>`, spawns whatever
//! producer/worker tasks it needs and returns once they're launched (it does
//! not await their completion — the tasks themselves close the queues when
//! they're done, the same fire-and-forget shape
//! `original_source/effectpy/stream.py`'s `asyncio.create_task(self._run(...))`
//! has). [`Stream::run`]/[`run_scoped`](Stream::run_scoped) are what actually
//! drive a stream to completion, racing a [`Sink`](sink::Sink) against the
//! two queues.
//!
//! Four termination rules hold across every operator below, mirroring the
//! source:
//! 1. A producer closes its output queue exactly once, when it has no more
//!    values to offer.
//! 2. A downstream close (the consumer stops receiving) propagates upstream:
//!    a stage that observes its output queue refuse a send closes its own
//!    input queue in turn.
//! 3. An exception raised by a stage's processing function pushes onto the
//!    error queue, then closes both the input and output queues for that
//!    stage.
//! 4. With more than one worker pulling from the same input queue, only the
//!    last worker to observe the input queue close (tracked by an atomic
//!    countdown) closes the output queue.

pub mod pipeline;
pub mod sink;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Exit};
use crate::channel::Channel;
use crate::context::Context;
use crate::effect::Effect;
use crate::error::Defect;
use crate::queue::Queue;
use crate::stream::sink::Sink;

type BuildFut = Pin<Box<dyn Future<Output = ()> + Send>>;
type BuildFn<A, E> = dyn Fn(Context, Queue<A>, Queue<Cause<E>>) -> BuildFut + Send + Sync;

#[derive(Debug, thiserror::Error)]
#[error("stream stage timed out after {0:?}")]
struct StreamTimeout(Duration);

/// Closes `out` at most once, even if called concurrently by more than one
/// worker — the atomic countdown in `via`/`via_acquire_release` already
/// picks a single "last worker", but callers that close on error paths too
/// (merge, filter, take) share this guard to stay idempotent regardless.
fn close_once<T>(out: &Queue<T>, closed: &AtomicBool) {
    if !closed.swap(true, Ordering::SeqCst) {
        out.close();
    }
}

/// A pull-based stream of `A` values, paired with an error channel carrying
/// [`Cause<E>`] for whatever failures its stages raise.
pub struct Stream<A, E> {
    build: Arc<BuildFn<A, E>>,
}

impl<A, E> Clone for Stream<A, E> {
    fn clone(&self) -> Self {
        Stream { build: self.build.clone() }
    }
}

impl<A, E> Stream<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn from_build<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Queue<A>, Queue<Cause<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Stream {
            build: Arc::new(move |ctx, out, err| Box::pin(f(ctx, out, err)) as BuildFut),
        }
    }

    /// Spawns this stream's driving task(s) against `out`/`err`, returning
    /// immediately without waiting for them to finish.
    fn spawn(&self, ctx: Context, out: Queue<A>, err: Queue<Cause<E>>) {
        let build = self.build.clone();
        tokio::spawn(async move { (build)(ctx, out, err).await });
    }

    /// Emits every item in `items`, then closes.
    pub fn from_iterable(items: Vec<A>) -> Self
    where
        A: Clone,
    {
        let items = Arc::new(items);
        Stream::from_build(move |_ctx, out: Queue<A>, _err: Queue<Cause<E>>| {
            let items = items.clone();
            async move {
                for item in items.iter() {
                    if out.send(item.clone()).await.is_err() {
                        break;
                    }
                }
                out.close();
            }
        })
    }

    /// Forwards whatever `src` produces, indefinitely — there is no natural
    /// "done" signal for a bare [`Channel`], so this stage only stops when
    /// `src` closes or the downstream refuses a send.
    pub fn from_channel(src: Channel<A>) -> Self {
        Stream::from_build(move |_ctx, out: Queue<A>, _err: Queue<Cause<E>>| {
            let src = src.clone();
            async move {
                loop {
                    match src.receive().await {
                        Ok(v) => {
                            if out.send(v).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }
            }
        })
    }

    /// Runs `f` over every item through a pool of `workers.max(1)` concurrent
    /// tasks, buffering up to `out_capacity` outputs. A `Fail`/`Die`/
    /// `Interrupt` from `f` pushes its [`Cause`] onto the error queue and
    /// closes both queues for this stage (rule 3); the last worker to see
    /// the input queue close is the one that closes the output queue
    /// (rule 4).
    pub fn via<B, F>(self, f: F, workers: usize, out_capacity: usize) -> Stream<B, E>
    where
        F: Fn(A) -> Effect<E, B> + Send + Sync + 'static,
        B: Send + 'static,
    {
        let workers = workers.max(1);
        let upstream = self.build.clone();
        let f = Arc::new(f);
        Stream::from_build(move |ctx, out: Queue<B>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            let f = f.clone();
            async move {
                let in_q: Queue<A> = Queue::new(out_capacity);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }

                let active = Arc::new(AtomicUsize::new(workers));
                let closed = Arc::new(AtomicBool::new(false));

                for _ in 0..workers {
                    let in_q = in_q.clone();
                    let out = out.clone();
                    let err = err.clone();
                    let ctx = ctx.clone();
                    let f = f.clone();
                    let active = active.clone();
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        loop {
                            let x = match in_q.receive().await {
                                Ok(x) => x,
                                Err(_) => {
                                    if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                        close_once(&out, &closed);
                                    }
                                    return;
                                }
                            };
                            match f(x).run(ctx.clone()).await {
                                Exit::Success(y) => {
                                    if out.send(y).await.is_err() {
                                        in_q.close();
                                        return;
                                    }
                                }
                                Exit::Failure(cause) => {
                                    let _ = err.send(cause).await;
                                    close_once(&out, &closed);
                                    in_q.close();
                                    return;
                                }
                            }
                        }
                    });
                }
                tokio::task::yield_now().await;
            }
        })
    }

    /// Transforms every item with a pure function, single worker, no extra
    /// buffering.
    pub fn map<B, F>(self, f: F) -> Stream<B, E>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via(
            move |x| {
                let f = f.clone();
                Effect::succeed(f(x))
            },
            1,
            0,
        )
    }

    /// Buffers up to `capacity` items between this stream and its consumer,
    /// otherwise passing values through unchanged.
    pub fn buffer(self, capacity: usize) -> Self
    where
        A: Clone + Sync,
    {
        self.via(Effect::succeed, 1, capacity)
    }

    /// Drops items for which `predicate` returns `false`.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let upstream = self.build.clone();
        let predicate = Arc::new(predicate);
        Stream::from_build(move |ctx, out: Queue<A>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            let predicate = predicate.clone();
            async move {
                let in_q: Queue<A> = Queue::new(0);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }
                loop {
                    match in_q.receive().await {
                        Ok(x) => {
                            if predicate(&x) && out.send(x).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                        Err(_) => {
                            out.close();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Emits only the first `n` items, then closes both queues regardless of
    /// whether upstream had more to offer.
    pub fn take(self, n: usize) -> Self {
        let upstream = self.build.clone();
        Stream::from_build(move |ctx, out: Queue<A>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            async move {
                let in_q: Queue<A> = Queue::new(0);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }
                let mut remaining = n;
                while remaining > 0 {
                    match in_q.receive().await {
                        Ok(x) => {
                            remaining -= 1;
                            if out.send(x).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                        Err(_) => break,
                    }
                }
                in_q.close();
                out.close();
            }
        })
    }

    /// Sleeps for `period` between each emitted item.
    pub fn throttle(self, period: Duration) -> Self {
        let upstream = self.build.clone();
        Stream::from_build(move |ctx, out: Queue<A>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            async move {
                let in_q: Queue<A> = Queue::new(0);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }
                loop {
                    match in_q.receive().await {
                        Ok(x) => {
                            tokio::time::sleep(period).await;
                            if out.send(x).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                        Err(_) => {
                            out.close();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Fails this stage (pushing a [`Cause::Die`] onto the error queue, then
    /// closing both queues) if no item arrives from upstream within `d`.
    pub fn timeout(self, d: Duration) -> Self {
        let upstream = self.build.clone();
        Stream::from_build(move |ctx, out: Queue<A>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            async move {
                let in_q: Queue<A> = Queue::new(0);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }
                loop {
                    match tokio::time::timeout(d, in_q.receive()).await {
                        Ok(Ok(x)) => {
                            if out.send(x).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                        Ok(Err(_)) => {
                            out.close();
                            return;
                        }
                        Err(_elapsed) => {
                            let _ = err.send(Cause::die(Defect::new(StreamTimeout(d)))).await;
                            in_q.close();
                            out.close();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Interleaves this stream with `other`; closes once both upstreams have
    /// closed.
    pub fn merge(self, other: Self) -> Self {
        let u1 = self.build.clone();
        let u2 = other.build.clone();
        Stream::from_build(move |ctx, out: Queue<A>, err: Queue<Cause<E>>| {
            let u1 = u1.clone();
            let u2 = u2.clone();
            async move {
                let q1: Queue<A> = Queue::new(0);
                let q2: Queue<A> = Queue::new(0);
                {
                    let ctx = ctx.clone();
                    let q1 = q1.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (u1)(ctx, q1, err).await });
                }
                {
                    let ctx = ctx.clone();
                    let q2 = q2.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (u2)(ctx, q2, err).await });
                }

                async fn pump<T: Send + 'static>(src: Queue<T>, out: Queue<T>) {
                    loop {
                        match src.receive().await {
                            Ok(v) => {
                                if out.send(v).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                }

                let t1 = tokio::spawn(pump(q1, out.clone()));
                let t2 = tokio::spawn(pump(q2, out.clone()));
                let _ = tokio::join!(t1, t2);
                out.close();
            }
        })
    }

    /// Like [`via`](Self::via), but each of the `workers.max(1)` workers
    /// acquires its own resource by re-running `acquire` before looping
    /// (mirroring [`crate::effect::acquire_release`] — `acquire` is cloned
    /// and invoked once per worker, not shared), and releases it via
    /// `release` in every case regardless of how the worker's loop ends.
    pub fn via_acquire_release<B, R, Rel, F>(
        self,
        acquire: Effect<E, R>,
        release: Rel,
        f: F,
        workers: usize,
        out_capacity: usize,
    ) -> Stream<B, E>
    where
        R: Clone + Send + 'static,
        B: Send + 'static,
        Rel: Fn(R) -> Effect<E, ()> + Send + Sync + 'static,
        F: Fn(R, A) -> Effect<E, B> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let upstream = self.build.clone();
        let release = Arc::new(release);
        let f = Arc::new(f);
        Stream::from_build(move |ctx, out: Queue<B>, err: Queue<Cause<E>>| {
            let upstream = upstream.clone();
            let acquire = acquire.clone();
            let release = release.clone();
            let f = f.clone();
            async move {
                let in_q: Queue<A> = Queue::new(out_capacity);
                {
                    let ctx = ctx.clone();
                    let in_q = in_q.clone();
                    let err = err.clone();
                    tokio::spawn(async move { (upstream)(ctx, in_q, err).await });
                }

                let active = Arc::new(AtomicUsize::new(workers));
                let closed = Arc::new(AtomicBool::new(false));

                for _ in 0..workers {
                    let in_q = in_q.clone();
                    let out = out.clone();
                    let err = err.clone();
                    let ctx = ctx.clone();
                    let acquire = acquire.clone();
                    let release = release.clone();
                    let f = f.clone();
                    let active = active.clone();
                    let closed = closed.clone();
                    let acquire = acquire.clone();
                    tokio::spawn(async move {
                        let resource = match acquire.run(ctx.clone()).await {
                            Exit::Success(r) => r,
                            Exit::Failure(cause) => {
                                let _ = err.send(cause).await;
                                if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                    close_once(&out, &closed);
                                }
                                return;
                            }
                        };
                        loop {
                            let x = match in_q.receive().await {
                                Ok(x) => x,
                                Err(_) => {
                                    if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                        close_once(&out, &closed);
                                    }
                                    break;
                                }
                            };
                            match f(resource.clone(), x).run(ctx.clone()).await {
                                Exit::Success(y) => {
                                    if out.send(y).await.is_err() {
                                        in_q.close();
                                        break;
                                    }
                                }
                                Exit::Failure(cause) => {
                                    let _ = err.send(cause).await;
                                    close_once(&out, &closed);
                                    in_q.close();
                                    break;
                                }
                            }
                        }
                        let _ = release(resource).run(ctx).await;
                    });
                }
                tokio::task::yield_now().await;
            }
        })
    }

    /// Spawns this stream against a fresh pair of queues, returning the
    /// output queue directly (the caller is responsible for draining it, and
    /// for the discarded error queue's failures).
    pub fn to_queue(self, ctx: Context, out_capacity: usize) -> Queue<A> {
        let out = Queue::new(out_capacity);
        let err = Queue::new(0);
        self.spawn(ctx, out.clone(), err);
        out
    }

    /// Drives this stream to completion against `sink`, racing the sink's
    /// receive loop over the value and error queues.
    pub fn run<B>(self, sink: Sink<A, E, B>) -> Effect<E, B>
    where
        B: Send + 'static,
    {
        Effect::new(move |ctx: Context| {
            let stream = self.clone();
            let sink = sink.clone();
            async move {
                let out: Queue<A> = Queue::new(0);
                let err: Queue<Cause<E>> = Queue::new(0);
                stream.spawn(ctx.clone(), out.clone(), err.clone());
                sink.run_with(out, err, ctx).await
            }
        })
    }

    /// Like [`run`](Self::run), but closes both queues (and so, transitively,
    /// every stage still feeding them) once the sink returns, registering the
    /// close as a finalizer on `scope` rather than running it inline.
    pub fn run_scoped<B>(self, sink: Sink<A, E, B>) -> Effect<E, B>
    where
        B: Send + 'static,
    {
        Effect::new(move |ctx: Context| {
            let stream = self.clone();
            let sink = sink.clone();
            async move {
                let out: Queue<A> = Queue::new(0);
                let err: Queue<Cause<E>> = Queue::new(0);
                stream.spawn(ctx.clone(), out.clone(), err.clone());
                let exit = sink.run_with(out.clone(), err.clone(), ctx).await;
                out.close();
                err.close();
                exit
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink::{drain, fold, head};

    #[tokio::test]
    async fn from_iterable_collects_in_order() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3]);
        let exit = s.run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        assert!(matches!(exit, Exit::Success(ref v) if v == &vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn map_square_s5() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3, 4]).map(|x| x * x);
        let exit = s.run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        assert!(matches!(exit, Exit::Success(ref v) if v == &vec![1, 4, 9, 16]));
    }

    #[tokio::test]
    async fn via_with_multiple_workers_preserves_the_multiset() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3, 4, 5, 6]).via(
            |x| Effect::succeed(x * x),
            3,
            0,
        );
        let exit = s.run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        let Exit::Success(mut v) = exit else { panic!("expected success") };
        v.sort();
        assert_eq!(v, vec![1, 4, 9, 16, 25, 36]);
    }

    #[tokio::test]
    async fn filter_drops_non_matching_items() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3, 4, 5]).filter(|x| x % 2 == 0);
        let exit = s.run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        assert!(matches!(exit, Exit::Success(ref v) if v == &vec![2, 4]));
    }

    #[tokio::test]
    async fn take_stops_after_n_items() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3, 4, 5]).take(2);
        let exit = s.run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        assert!(matches!(exit, Exit::Success(ref v) if v == &vec![1, 2]));
    }

    #[tokio::test]
    async fn merge_emits_items_from_both_sources() {
        let a: Stream<i32, String> = Stream::from_iterable(vec![1, 2]);
        let b: Stream<i32, String> = Stream::from_iterable(vec![10, 20]);
        let exit = a.merge(b).run(fold(Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        })).run_default().await;
        let Exit::Success(mut v) = exit else { panic!("expected success") };
        v.sort();
        assert_eq!(v, vec![1, 2, 10, 20]);
    }

    #[tokio::test]
    async fn stage_failure_surfaces_on_the_sink() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3]).via(
            |x| {
                if x == 2 {
                    Effect::fail("boom".to_string())
                } else {
                    Effect::succeed(x)
                }
            },
            1,
            0,
        );
        let exit = s.run(drain()).run_default().await;
        assert!(matches!(exit, Exit::Failure(cause) if cause.is_fail()));
    }

    #[tokio::test]
    async fn head_returns_the_first_item_and_drops_the_rest() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3]);
        let exit = s.run(head()).run_default().await;
        assert!(matches!(exit, Exit::Success(Some(1))));
    }

    #[tokio::test]
    async fn empty_stream_head_is_none() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![]);
        let exit = s.run(head()).run_default().await;
        assert!(matches!(exit, Exit::Success(None)));
    }

    #[tokio::test]
    async fn to_queue_exposes_the_raw_output() {
        let s: Stream<i32, String> = Stream::from_iterable(vec![1, 2, 3]);
        let out = s.to_queue(Context::new(), 0);
        assert_eq!(out.receive().await.unwrap(), 1);
        assert_eq!(out.receive().await.unwrap(), 2);
        assert_eq!(out.receive().await.unwrap(), 3);
        assert!(out.receive().await.is_err());
    }
}
