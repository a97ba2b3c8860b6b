//! Boundary traits a collected-spans/metrics flush plugs into.
//!
//! `original_source/effectpy/exporters.py`'s `export_spans_otlp_http`/
//! `export_metrics_otlp_http` POST a rough OTLP-shaped JSON payload over
//! `aiohttp`; that wire format and HTTP client are explicitly out of this
//! crate's core scope (no networked exporter ships). What does belong in
//! core is the *contract* a [`Tracer`]/[`MetricsRegistry`] flush can target —
//! [`SpanExporter`] and [`MetricExporter`] — plus a no-op default and an
//! in-memory double useful in tests.

use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::services::metrics::MetricsSnapshot;
use crate::services::tracer::Span;

/// Accepts a batch of finished spans, however it chooses to dispose of them.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export_spans(&self, spans: Vec<Span>);
}

/// Accepts a point-in-time metrics snapshot.
#[async_trait]
pub trait MetricExporter: Send + Sync {
    async fn export_metrics(&self, snapshot: MetricsSnapshot);
}

/// Discards everything handed to it. The default when no exporter is wired
/// in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl SpanExporter for NoopExporter {
    async fn export_spans(&self, _spans: Vec<Span>) {}
}

#[async_trait]
impl MetricExporter for NoopExporter {
    async fn export_metrics(&self, _snapshot: MetricsSnapshot) {}
}

/// Accumulates every batch handed to it in memory, for assertions in tests
/// that exercise a `Tracer`/`MetricsRegistry` flush path without a real
/// network sink.
#[derive(Default)]
pub struct RecordingExporter {
    spans: Mutex<Vec<Span>>,
    snapshots: Mutex<Vec<MetricsSnapshot>>,
}

impl RecordingExporter {
    pub fn new() -> Self {
        RecordingExporter::default()
    }

    /// Every span handed to `export_spans` so far, in call order.
    pub async fn recorded_spans(&self) -> Vec<Span> {
        self.spans.lock().await.clone()
    }

    /// Every snapshot handed to `export_metrics` so far, in call order.
    pub async fn recorded_snapshots(&self) -> Vec<MetricsSnapshot> {
        self.snapshots.lock().await.clone()
    }

    /// Renders the most recent snapshot as JSON, for a minimal flush path a
    /// host process could hand to an actual wire exporter. Requires the
    /// `metrics-exporter` feature.
    #[cfg(feature = "metrics-exporter")]
    pub async fn last_snapshot_json(&self) -> Option<String> {
        let snapshots = self.snapshots.lock().await;
        snapshots.last().map(|s| serde_json::to_string(s).expect("MetricsSnapshot always serializes"))
    }
}

#[async_trait]
impl SpanExporter for RecordingExporter {
    async fn export_spans(&self, spans: Vec<Span>) {
        self.spans.lock().await.extend(spans);
    }
}

#[async_trait]
impl MetricExporter for RecordingExporter {
    async fn export_metrics(&self, snapshot: MetricsSnapshot) {
        self.snapshots.lock().await.push(snapshot);
    }
}
