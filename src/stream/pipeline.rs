//! Named-stage sugar over [`Stream`](super::Stream)/[`instrument`].
//!
//! Supplements the core `Stream` operators with the builder shape
//! `original_source/effectpy/pipeline.py`'s `Stage`/`Pipeline` offer: a
//! `stage(name, f)` helper that pairs a processing function with a worker
//! count and output capacity, and a `Pipeline` that chains such stages onto
//! a [`Channel`] source, instrumenting each one by name before draining the
//! result into a caller-supplied output `Channel`. No new termination or
//! backpressure semantics — every stage here is just `Stream::via` plus
//! `instrument`, wired up with less boilerplate.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel::Channel;
use crate::context::Context;
use crate::effect::Effect;
use crate::services::instrument::instrument;
use crate::stream::Stream;

/// A single pipeline stage: a processing function plus its worker count and
/// output buffer capacity, as consumed by [`Pipeline::via`].
#[derive(Clone)]
pub struct Stage<A, B, E> {
    name: String,
    func: Arc<dyn Fn(A) -> Effect<E, B> + Send + Sync>,
    workers: usize,
    out_capacity: usize,
}

impl<A, B, E> Stage<A, B, E> {
    /// The name this stage is instrumented under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builds a named [`Stage`] running `f` across `workers.max(1)` concurrent
/// tasks, buffering up to `out_capacity` outputs downstream.
pub fn stage<A, B, E, F>(
    name: impl Into<String>,
    f: F,
    workers: usize,
    out_capacity: usize,
) -> Stage<A, B, E>
where
    F: Fn(A) -> Effect<E, B> + Send + Sync + 'static,
{
    Stage {
        name: name.into(),
        func: Arc::new(f),
        workers: workers.max(1),
        out_capacity,
    }
}

/// Chains named stages over a [`Channel`] source, draining the result into
/// an output `Channel`.
///
/// `Pipeline<A, E>` tracks only the type flowing out of the most recently
/// added stage; each call to [`via`](Self::via) consumes `self` and returns
/// a `Pipeline<B, E>`, the same stage-chaining shape the source's
/// `Pipeline.via` has (append a stage, return `self`), just made type-safe
/// by changing type on every call since Rust has no single mutable type
/// across stages whose item type changes.
pub struct Pipeline<A, E> {
    stream: Stream<A, E>,
    stage_names: Vec<String>,
}

impl<A, E> Pipeline<A, E>
where
    A: Send + Sync + Clone + 'static,
    E: Send + 'static,
{
    /// Starts a pipeline reading from `source`.
    pub fn from_channel(source: Channel<A>) -> Self {
        Pipeline {
            stream: Stream::from_channel(source),
            stage_names: Vec::new(),
        }
    }

    /// Appends `stage` to the chain, instrumenting its processing function
    /// under the stage's name before wiring it into `Stream::via`.
    pub fn via<B>(self, stage: Stage<A, B, E>) -> Pipeline<B, E>
    where
        B: Send + Sync + Clone + 'static,
        E: std::fmt::Display,
    {
        let Pipeline {
            stream,
            mut stage_names,
        } = self;
        let name = stage.name.clone();
        let func = stage.func.clone();
        let tags = BTreeMap::new();
        let next = stream.via(
            move |x| instrument(name.clone(), tags.clone(), func(x)),
            stage.workers,
            stage.out_capacity,
        );
        stage_names.push(stage.name);
        Pipeline {
            stream: next,
            stage_names,
        }
    }

    /// The names of every stage appended so far, in order.
    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Drives the chain to completion, forwarding every surviving value into
    /// `out` until upstream closes, then closing `out` in turn. Returns an
    /// effect that completes once the pump has relayed everything (or a
    /// stage failure has closed the chain).
    pub fn to_channel(self, out: Channel<A>) -> Effect<E, ()> {
        let stream = self.stream;
        Effect::new(move |ctx: Context| {
            let stream = stream.clone();
            let out = out.clone();
            async move {
                let out_q = stream.to_queue(ctx, 0);
                loop {
                    match out_q.receive().await {
                        Ok(v) => {
                            if out.send(v).await.is_err() {
                                return crate::cause::Exit::Success(());
                            }
                        }
                        Err(_) => {
                            out.close();
                            return crate::cause::Exit::Success(());
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Exit;

    #[tokio::test]
    async fn chain_relays_every_stage_transform() {
        let src: Channel<i32> = Channel::unbounded();
        for i in 0..3 {
            src.send(i).await.unwrap();
        }
        src.close();

        let out: Channel<i32> = Channel::unbounded();
        let pipeline = Pipeline::<i32, String>::from_channel(src)
            .via(stage("double", |x: i32| Effect::succeed(x * 2), 1, 0))
            .via(stage("inc", |x: i32| Effect::succeed(x + 1), 1, 0));
        assert_eq!(pipeline.stage_names(), &["double", "inc"]);

        let exit = pipeline.to_channel(out.clone()).run_default().await;
        assert!(matches!(exit, Exit::Success(())));

        let mut got = Vec::new();
        while let Ok(v) = out.receive().await {
            got.push(v);
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 3, 5]);
    }
}
