//! Consumers that drive a [`Stream`](super::Stream) to completion by racing
//! its value and error queues.
//!
//! Grounded in `original_source/effectpy/stream.py`'s `sink_fold`/`sink_head`/
//! `sink_drain`: each races a receive on the value queue against one on the
//! error queue, preferring the error if both are ready (the source's
//! `asyncio.wait({t_val, t_err}, FIRST_COMPLETED)` with an explicit priority
//! check on `t_err`), and treats the value queue closing as ordinary
//! completion regardless of the error queue's state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cause::{Cause, Exit};
use crate::context::Context;
use crate::queue::Queue;

type SinkFut<E, B> = Pin<Box<dyn Future<Output = Exit<E, B>> + Send>>;
type SinkFn<A, E, B> = dyn Fn(Queue<A>, Queue<Cause<E>>, Context) -> SinkFut<E, B> + Send + Sync;

/// A consumer of a stream's value and error queues, producing `B` (or
/// propagating whatever [`Cause<E>`] first appears on the error queue).
pub struct Sink<A, E, B> {
    run: Arc<SinkFn<A, E, B>>,
}

impl<A, E, B> Clone for Sink<A, E, B> {
    fn clone(&self) -> Self {
        Sink { run: self.run.clone() }
    }
}

impl<A, E, B> Sink<A, E, B>
where
    A: Send + 'static,
    E: Send + 'static,
    B: Send + 'static,
{
    fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Queue<A>, Queue<Cause<E>>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<E, B>> + Send + 'static,
    {
        Sink {
            run: Arc::new(move |out, err, ctx| Box::pin(f(out, err, ctx)) as SinkFut<E, B>),
        }
    }

    pub(crate) async fn run_with(&self, out: Queue<A>, err: Queue<Cause<E>>, ctx: Context) -> Exit<E, B> {
        (self.run)(out, err, ctx).await
    }
}

/// Races `out`/`err`, yielding `Ok(value)` per item, `Err(cause)` on the
/// first error, or `None` once `out` closes (with `err` never having
/// produced anything). Once `err` itself closes — which, in normal
/// operation, only happens after a sink has already returned, via
/// `Stream::run_scoped` — this stops racing it and simply drains `out`,
/// avoiding a busy spin against an already-closed channel.
async fn race_receive<A, E>(out: &Queue<A>, err: &mut Option<Queue<Cause<E>>>) -> Option<Result<A, Cause<E>>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    match err {
        Some(err_q) => {
            tokio::select! {
                biased;
                e = err_q.receive() => match e {
                    Ok(cause) => Some(Err(cause)),
                    Err(_) => {
                        *err = None;
                        Box::pin(race_receive(out, err)).await
                    }
                },
                v = out.receive() => match v {
                    Ok(value) => Some(Ok(value)),
                    Err(_) => None,
                },
            }
        }
        None => out.receive().await.ok().map(Ok),
    }
}

/// Folds every value through `f`, starting from `initial`; stops (success)
/// once the value queue closes, or fails with the first `Cause` to appear on
/// the error queue.
pub fn fold<A, E, B, F>(initial: B, f: F) -> Sink<A, E, B>
where
    A: Send + 'static,
    E: Send + 'static,
    B: Clone + Send + 'static,
    F: Fn(B, A) -> B + Send + Sync + 'static,
{
    Sink::new(move |out, err, _ctx| {
        let mut acc = initial.clone();
        let f_ref = &f;
        async move {
            let mut err = Some(err);
            loop {
                match race_receive(&out, &mut err).await {
                    Some(Ok(value)) => acc = f_ref(acc, value),
                    Some(Err(cause)) => return Exit::Failure(cause),
                    None => return Exit::Success(acc),
                }
            }
        }
    })
}

/// The first value to arrive, or `None` if the stream closes without
/// producing one.
pub fn head<A, E>() -> Sink<A, E, Option<A>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Sink::new(|out, err, _ctx| async move {
        let mut err = Some(err);
        match race_receive(&out, &mut err).await {
            Some(Ok(value)) => Exit::Success(Some(value)),
            Some(Err(cause)) => Exit::Failure(cause),
            None => Exit::Success(None),
        }
    })
}

/// Discards every value, completing once the value queue closes.
pub fn drain<A, E>() -> Sink<A, E, ()>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Sink::new(|out, err, _ctx| async move {
        let mut err = Some(err);
        loop {
            match race_receive(&out, &mut err).await {
                Some(Ok(_)) => continue,
                Some(Err(cause)) => return Exit::Failure(cause),
                None => return Exit::Success(()),
            }
        }
    })
}
