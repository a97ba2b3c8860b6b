//! Minimal in-process span tracer.
//!
//! Spans form a stack per fiber via the same task-local, fork-inherited
//! machinery [`FiberRef`](crate::refs::FiberRef) already provides for user
//! code — `start_span` pushes a new current span id (remembering the
//! previous one as `parent_id`), `end_span` pops back to it. A forked child
//! fiber inherits whatever span was current at fork time, then grows its own
//! independent stack from there.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::RuntimeError;
use crate::layer::{from_resource, Layer};
use crate::refs::FiberRef;

fn trace_id_ref() -> &'static FiberRef<Option<String>> {
    static REF: OnceLock<FiberRef<Option<String>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(None))
}

fn span_id_ref() -> &'static FiberRef<Option<String>> {
    static REF: OnceLock<FiberRef<Option<String>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(None))
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> String {
    format!("{:016x}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The current fiber's active trace id, if any span is open.
pub fn current_trace_id() -> Option<String> {
    (*trace_id_ref().get()).clone()
}

/// The current fiber's active span id, if any span is open.
pub fn current_span_id() -> Option<String> {
    (*span_id_ref().get()).clone()
}

pub(crate) fn current_ids() -> (Option<String>, Option<String>) {
    (current_trace_id(), current_span_id())
}

/// One recorded span. Cheaply cloned: mutation happens through the owning
/// [`Tracer`], not through clones of this struct, but the final snapshot
/// handed back (e.g. to an exporter) is a plain value.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub start: f64,
    pub end: Option<f64>,
    pub status: String,
    pub error: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub events: Vec<(String, f64, BTreeMap<String, String>)>,
    pub links: Vec<(String, String, BTreeMap<String, String>)>,
}

impl Span {
    fn new(trace_id: String, span_id: String, parent_id: Option<String>, name: String) -> Self {
        Span {
            trace_id,
            span_id,
            parent_id,
            name,
            start: now_secs(),
            end: None,
            status: "OK".to_string(),
            error: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }
}

/// A handle onto one in-flight span, returned by
/// [`Tracer::start_span`](Tracer::start_span). Carries enough to locate the
/// span's slot for `end_span`/`add_attribute`/etc. without re-searching.
#[derive(Clone)]
pub struct SpanHandle {
    index: usize,
    parent_span_id: Option<String>,
}

/// Collects spans started through it; never exports anywhere on its own —
/// see [`crate::services::exporter`] for the boundary a `SpanExporter`
/// plugs into.
#[derive(Default)]
pub struct Tracer {
    spans: Mutex<Vec<Span>>,
}

impl Tracer {
    /// A fresh tracer with no recorded spans.
    pub fn new() -> Self {
        Tracer::default()
    }

    /// Starts a span named `name`, nesting under whatever span is currently
    /// active on this fiber (or starting a fresh trace if none is).
    pub async fn start_span(&self, name: &str) -> SpanHandle {
        let trace_id = current_trace_id().unwrap_or_else(fresh_id);
        let parent_span_id = current_span_id();
        let span_id = fresh_id();
        trace_id_ref().set(Some(trace_id.clone()));
        span_id_ref().set(Some(span_id.clone()));

        let span = Span::new(trace_id, span_id, parent_span_id.clone(), name.to_string());
        let mut spans = self.spans.lock().await;
        let index = spans.len();
        spans.push(span);
        SpanHandle { index, parent_span_id }
    }

    /// Closes `span`, restoring the current-fiber span id to whatever was
    /// active before it was started.
    pub async fn end_span(&self, span: &SpanHandle, status: &str, error: Option<&str>) {
        {
            let mut spans = self.spans.lock().await;
            if let Some(s) = spans.get_mut(span.index) {
                s.end = Some(now_secs());
                s.status = status.to_string();
                s.error = error.map(|e| e.to_string());
            }
        }
        span_id_ref().set(span.parent_span_id.clone());
    }

    /// Attaches a string attribute to `span`.
    pub async fn add_attribute(&self, span: &SpanHandle, key: &str, value: &str) {
        if let Some(s) = self.spans.lock().await.get_mut(span.index) {
            s.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Records a timestamped event on `span`.
    pub async fn add_event(&self, span: &SpanHandle, name: &str, attrs: BTreeMap<String, String>) {
        if let Some(s) = self.spans.lock().await.get_mut(span.index) {
            s.events.push((name.to_string(), now_secs(), attrs));
        }
    }

    /// Records a link from `span` to another trace/span pair.
    pub async fn add_link(
        &self,
        span: &SpanHandle,
        trace_id: &str,
        span_id: &str,
        attrs: BTreeMap<String, String>,
    ) {
        if let Some(s) = self.spans.lock().await.get_mut(span.index) {
            s.links.push((trace_id.to_string(), span_id.to_string(), attrs));
        }
    }

    /// A snapshot of every span recorded so far, in start order.
    pub async fn export(&self) -> Vec<Span> {
        self.spans.lock().await.clone()
    }
}

/// Builds the in-process `Tracer`.
pub fn tracer_layer() -> Layer {
    from_resource::<Tracer, _, _, _, _>(
        |_parent: Context| async move { Ok::<Tracer, RuntimeError>(Tracer::new()) },
        |_t: Arc<Tracer>| async move {},
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_spans_track_parent_child() {
        let tracer = Tracer::new();
        let parent = tracer.start_span("outer").await;
        let parent_span_id = current_span_id().unwrap();
        let child = tracer.start_span("inner").await;
        assert_ne!(current_span_id().unwrap(), parent_span_id);
        tracer.end_span(&child, "OK", None).await;
        assert_eq!(current_span_id().unwrap(), parent_span_id);
        tracer.end_span(&parent, "OK", None).await;
        assert_eq!(current_span_id(), None);
    }

    #[tokio::test]
    async fn end_span_records_status_and_error() {
        let tracer = Tracer::new();
        let span = tracer.start_span("op").await;
        tracer.end_span(&span, "ERROR", Some("boom")).await;
        let exported = tracer.export().await;
        assert_eq!(exported[0].status, "ERROR");
        assert_eq!(exported[0].error.as_deref(), Some("boom"));
    }
}
