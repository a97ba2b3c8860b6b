//! In-process counters, gauges, and histograms.
//!
//! Grounded in `original_source/effectpy/metrics.py`'s `MetricsRegistry`:
//! `counter`/`gauge`/`histogram` lazily create-and-cache the named metric,
//! keyed by name plus sorted label pairs so `(name, labels)` identifies one
//! instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::RuntimeError;
use crate::layer::{from_resource, Layer};

/// Default histogram bucket boundaries (seconds), matching `instrument`'s
/// duration histograms.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A monotonically-increasing count.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Counter {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: u64,
}

impl Counter {
    pub fn inc(&mut self, n: u64) {
        self.value += n;
    }
}

/// A value that can move up or down.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Gauge {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Gauge {
    pub fn set(&mut self, v: f64) {
        self.value = v;
    }
    pub fn inc(&mut self, v: f64) {
        self.value += v;
    }
    pub fn dec(&mut self, v: f64) {
        self.value -= v;
    }
}

/// A cumulative distribution over fixed buckets, plus sum/count for the
/// mean.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Histogram {
    pub name: String,
    pub help: String,
    pub buckets: Vec<f64>,
    pub labels: BTreeMap<String, String>,
    counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    fn new(name: String, help: String, buckets: Vec<f64>, labels: BTreeMap<String, String>) -> Self {
        let counts = vec![0u64; buckets.len() + 1];
        Histogram {
            name,
            help,
            buckets,
            labels,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    /// Records one observation, placing it in the first bucket whose bound
    /// is `>= v`, or the overflow (`+Inf`) bucket otherwise.
    pub fn observe(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
        match self.buckets.iter().position(|&b| v <= b) {
            Some(i) => self.counts[i] += 1,
            None => {
                let last = self.counts.len() - 1;
                self.counts[last] += 1;
            }
        }
    }

    /// Per-bucket cumulative-or-raw counts, in bucket order, with the
    /// overflow bucket last.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.counts
    }
}

fn metric_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}|{}", pairs.join(","))
}

/// The registry of every counter/gauge/histogram created through it.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, Counter>>,
    gauges: Mutex<BTreeMap<String, Gauge>>,
    hists: Mutex<BTreeMap<String, Histogram>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// The named counter, creating it with `help`/`labels` on first use.
    pub async fn counter(&self, name: &str, help: &str, labels: BTreeMap<String, String>) -> u64 {
        let key = metric_key(name, &labels);
        let mut counters = self.counters.lock().await;
        counters
            .entry(key)
            .or_insert_with(|| Counter {
                name: name.to_string(),
                help: help.to_string(),
                labels,
                value: 0,
            })
            .value
    }

    /// Increments the named counter by `n`, creating it if absent.
    pub async fn inc_counter(&self, name: &str, help: &str, labels: BTreeMap<String, String>, n: u64) {
        let key = metric_key(name, &labels);
        let mut counters = self.counters.lock().await;
        counters
            .entry(key)
            .or_insert_with(|| Counter {
                name: name.to_string(),
                help: help.to_string(),
                labels,
                value: 0,
            })
            .inc(n);
    }

    /// Applies `f` to the named gauge, creating it at `0.0` if absent.
    pub async fn with_gauge<F: FnOnce(&mut Gauge)>(
        &self,
        name: &str,
        help: &str,
        labels: BTreeMap<String, String>,
        f: F,
    ) {
        let key = metric_key(name, &labels);
        let mut gauges = self.gauges.lock().await;
        let gauge = gauges.entry(key).or_insert_with(|| Gauge {
            name: name.to_string(),
            help: help.to_string(),
            labels,
            value: 0.0,
        });
        f(gauge);
    }

    /// Records `v` on the named histogram, creating it with `buckets` (or
    /// [`DEFAULT_BUCKETS`] if `None`) on first use.
    pub async fn observe_histogram(
        &self,
        name: &str,
        help: &str,
        buckets: Option<Vec<f64>>,
        labels: BTreeMap<String, String>,
        v: f64,
    ) {
        let key = metric_key(name, &labels);
        let mut hists = self.hists.lock().await;
        let hist = hists.entry(key).or_insert_with(|| {
            Histogram::new(
                name.to_string(),
                help.to_string(),
                buckets.unwrap_or_else(|| DEFAULT_BUCKETS.to_vec()),
                labels,
            )
        });
        hist.observe(v);
    }

    /// A snapshot of every counter/gauge/histogram currently registered.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().await.values().cloned().collect(),
            gauges: self.gauges.lock().await.values().cloned().collect(),
            histograms: self.hists.lock().await.values().cloned().collect(),
        }
    }
}

/// A point-in-time copy of every metric in a [`MetricsRegistry`], the shape
/// handed to a [`crate::services::exporter::MetricExporter`].
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterSnapshot>,
    pub gauges: Vec<GaugeSnapshot>,
    pub histograms: Vec<HistogramSnapshot>,
}

pub type CounterSnapshot = Counter;
pub type GaugeSnapshot = Gauge;
pub type HistogramSnapshot = Histogram;

/// Builds the in-process `MetricsRegistry`.
pub fn metrics_layer() -> Layer {
    from_resource::<MetricsRegistry, _, _, _, _>(
        |_parent: Context| async move { Ok::<MetricsRegistry, RuntimeError>(MetricsRegistry::new()) },
        |_m: Arc<MetricsRegistry>| async move {},
    )
}
