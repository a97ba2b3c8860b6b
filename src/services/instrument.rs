//! Wraps an effect with start/end logging, span tracing, and a duration
//! histogram, all best-effort against whatever subset of `Logger`/`Tracer`/
//! `MetricsRegistry` happens to be bound in the running `Context`.
//!
//! Grounded in `original_source/effectpy/instrument.py`'s `instrument`: start
//! a span (if a `Tracer` is present) → log `start <name>` (if a `Logger` is
//! present) → run the inner effect, timed → on `Fail` log `fail` and mark the
//! span `ERROR`; on `Die`/`Interrupt` log `die` and mark the span `DIE`; in
//! every case end the span `OK` if it wasn't already ended, record the
//! elapsed seconds into `effect_duration_seconds_<name>` (tag suffix sorted
//! by key, matching `MetricsRegistry`'s own `metric_key` convention), then
//! log `end <name>`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::cause::Exit;
use crate::context::Context;
use crate::effect::Effect;
use crate::services::logger::Logger;
use crate::services::metrics::MetricsRegistry;
use crate::services::tracer::Tracer;

fn tag_suffix(tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" {}", pairs.join(", "))
}

fn histogram_name(name: &str, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return format!("effect_duration_seconds_{name}");
    }
    let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("effect_duration_seconds_{name}_{}", pairs.join("_"))
}

/// Wraps `eff` with start/end logging, span tracing, and a duration
/// histogram keyed by `name` (plus `tags`), reading whichever of
/// `Logger`/`Tracer`/`MetricsRegistry` are bound in the `Context` the
/// resulting effect is eventually run against.
pub fn instrument<E, A>(name: impl Into<String>, tags: BTreeMap<String, String>, eff: Effect<E, A>) -> Effect<E, A>
where
    E: fmt::Display + Send + 'static,
    A: Send + 'static,
{
    let name: std::sync::Arc<str> = std::sync::Arc::from(name.into());
    let tags = std::sync::Arc::new(tags);
    Effect::new(move |ctx: Context| {
        let eff = eff.clone();
        let name = name.clone();
        let tags = tags.clone();
        async move {
            let logger = ctx.try_get::<Box<dyn Logger>>();
            let metrics = ctx.try_get::<MetricsRegistry>();
            let tracer = ctx.try_get::<Tracer>();

            let span_name = format!("{name}{}", tag_suffix(&tags));
            let span = if let Some(t) = &tracer {
                Some(t.start_span(&span_name).await)
            } else {
                None
            };
            if let Some(l) = &logger {
                l.info(&format!("start {name}")).await;
            }

            let start = Instant::now();
            let exit = eff.run(ctx.clone()).await;
            let elapsed = start.elapsed().as_secs_f64();

            let end_status = match &exit {
                Exit::Success(_) => "OK",
                Exit::Failure(cause) => {
                    let rendered = cause.render();
                    if cause.is_fail() {
                        if let Some(l) = &logger {
                            l.error(&format!("fail {name}: {rendered}")).await;
                        }
                        "ERROR"
                    } else {
                        if let Some(l) = &logger {
                            l.error(&format!("die {name}: {rendered}")).await;
                        }
                        "DIE"
                    }
                }
            };
            if let (Some(t), Some(s)) = (&tracer, &span) {
                let error = if end_status == "OK" { None } else { Some("see log") };
                t.end_span(s, end_status, error).await;
            }

            if let Some(m) = &metrics {
                let hist_name = histogram_name(&name, &tags);
                m.observe_histogram(
                    &hist_name,
                    &format!("Duration of effect {name}"),
                    None,
                    (*tags).clone(),
                    elapsed,
                )
                .await;
            }
            if let Some(l) = &logger {
                l.info(&format!("end {name}")).await;
            }
            exit
        }
    })
}
