//! Structured logging service.
//!
//! [`Logger`] is a small trait — `debug`/`info`/`warn`/`error`, each taking a
//! pre-formatted message and a field map — with two implementations:
//! [`ConsoleLogger`], the always-available default that writes to stderr,
//! and, under the `tracing` feature, [`TracingLogger`], which forwards to
//! the `tracing` crate's own level macros so a host process's installed
//! subscriber sees these log lines too. Both read the current fiber's
//! trace/span id (set up by [`crate::services::tracer`]) so lines correlate
//! with the active span without every call site threading ids through.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::layer::{from_resource, Layer};

/// A field map attached to a log line, ordered for deterministic rendering.
pub type Fields = BTreeMap<String, String>;

const LEVEL_DEBUG: u32 = 10;
const LEVEL_INFO: u32 = 20;
const LEVEL_WARN: u32 = 30;
const LEVEL_ERROR: u32 = 40;

/// A structured log sink bound into the running `Context`.
#[async_trait]
pub trait Logger: Send + Sync {
    async fn log(&self, level: u32, level_name: &str, msg: &str, fields: &Fields);

    async fn debug(&self, msg: &str) {
        self.log(LEVEL_DEBUG, "DEBUG", msg, &Fields::new()).await;
    }
    async fn info(&self, msg: &str) {
        self.log(LEVEL_INFO, "INFO", msg, &Fields::new()).await;
    }
    async fn warn(&self, msg: &str) {
        self.log(LEVEL_WARN, "WARN", msg, &Fields::new()).await;
    }
    async fn error(&self, msg: &str) {
        self.log(LEVEL_ERROR, "ERROR", msg, &Fields::new()).await;
    }
}

/// Writes `LEVEL message [trace_id=.. span_id=..] k=v ...` to stderr, gated
/// by a minimum level.
pub struct ConsoleLogger {
    name: String,
    level: AtomicU32,
}

impl ConsoleLogger {
    /// A logger named `name`, filtering out anything below `min_level`
    /// (`"DEBUG"`, `"INFO"`, `"WARN"`, `"ERROR"`; unrecognized defaults to
    /// `"INFO"`).
    pub fn new(name: impl Into<String>, min_level: &str) -> Self {
        ConsoleLogger {
            name: name.into(),
            level: AtomicU32::new(level_value(min_level)),
        }
    }

    /// Adjusts the minimum level at runtime.
    pub fn set_level(&self, min_level: &str) {
        self.level.store(level_value(min_level), Ordering::Relaxed);
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        ConsoleLogger::new("effect-rail", "INFO")
    }
}

fn level_value(name: &str) -> u32 {
    match name.to_ascii_uppercase().as_str() {
        "DEBUG" => LEVEL_DEBUG,
        "WARN" => LEVEL_WARN,
        "ERROR" => LEVEL_ERROR,
        _ => LEVEL_INFO,
    }
}

#[async_trait]
impl Logger for ConsoleLogger {
    async fn log(&self, level: u32, level_name: &str, msg: &str, fields: &Fields) {
        if level < self.level.load(Ordering::Relaxed) {
            return;
        }
        let (trace_id, span_id) = crate::services::tracer::current_ids();
        let mut extras = String::new();
        for (k, v) in fields {
            extras.push(' ');
            extras.push_str(k);
            extras.push('=');
            extras.push_str(v);
        }
        let corr = match (trace_id, span_id) {
            (Some(t), Some(s)) => format!(" trace_id={t} span_id={s}"),
            _ => String::new(),
        };
        eprintln!("{} {level_name}: {msg}{corr}{extras}", self.name);
    }
}

/// Forwards to the `tracing` crate's level macros instead of printing
/// directly, so a host process's own subscriber (file, JSON, OTLP exporter)
/// sees these records.
#[cfg(feature = "tracing")]
pub struct TracingLogger;

#[cfg(feature = "tracing")]
#[async_trait]
impl Logger for TracingLogger {
    async fn log(&self, level: u32, _level_name: &str, msg: &str, fields: &Fields) {
        let (trace_id, span_id) = crate::services::tracer::current_ids();
        let trace_id = trace_id.unwrap_or_default();
        let span_id = span_id.unwrap_or_default();
        match level {
            l if l >= LEVEL_ERROR => tracing::error!(trace_id, span_id, ?fields, "{msg}"),
            l if l >= LEVEL_WARN => tracing::warn!(trace_id, span_id, ?fields, "{msg}"),
            l if l >= LEVEL_INFO => tracing::info!(trace_id, span_id, ?fields, "{msg}"),
            _ => tracing::debug!(trace_id, span_id, ?fields, "{msg}"),
        }
    }
}

/// Builds the default `ConsoleLogger`.
pub fn logger_layer() -> Layer {
    from_resource::<Box<dyn Logger>, _, _, _, _>(
        |_parent: Context| async move { Ok(Box::new(ConsoleLogger::default()) as Box<dyn Logger>) },
        |_l: Arc<Box<dyn Logger>>| async move {},
    )
}

/// Builds the `tracing`-backed logger.
#[cfg(feature = "tracing")]
pub fn tracing_logger_layer() -> Layer {
    from_resource::<Box<dyn Logger>, _, _, _, _>(
        |_parent: Context| async move { Ok(Box::new(TracingLogger) as Box<dyn Logger>) },
        |_l: Arc<Box<dyn Logger>>| async move {},
    )
}

/// Logs `what failed while swallowed` at `error` level if a `Logger` is
/// bound in `ctx`, otherwise does nothing — used by `Effect` combinators
/// (`ensuring`, `on_error`, `on_interrupt`, `acquire_release`) that
/// intentionally discard a finalizer's own failure to preserve the original
/// outcome, but still want that discarded failure observable.
pub async fn log_swallowed(ctx: &Context, what: &str, rendered_cause: &str) {
    if let Some(logger) = ctx.try_get::<Box<dyn Logger>>() {
        logger
            .error(&format!("swallowed failure in {what}: {rendered_cause}"))
            .await;
    }
}
