//! Structured logging for the sync engine.
//!
//! Emits one JSON object per line with the fields `level` (lowercase
//! string), `ts` (Unix timestamp with fractional seconds), `logger` (the
//! tracing target), `msg`, plus any event fields as additional top-level
//! keys. External tooling pretty-prints this stream; loggers prefixed
//! `DEBUG-VC` denote internal diagnostic channels and are emitted via
//! `tracing` targets, e.g. `debug!(target: "DEBUG-VC", ...)`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize the global tracing subscriber with the JSON line format.
///
/// The filter defaults to `info` plus `debug` for this crate's own targets
/// and can be overridden with `RUST_LOG`. Diagnostic `DEBUG-VC.*` channels
/// are enabled by adding e.g. `RUST_LOG=DEBUG-VC=debug`.
pub fn init_telemetry() -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nestvc=debug,kube=info,tower=warn,hyper=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer().event_format(JsonLineFormat);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

/// Event formatter producing the `{level, ts, logger, msg, ...}` shape.
///
/// The stock JSON formatter nests event fields under `"fields"` and writes
/// RFC 3339 timestamps; the downstream pretty-printer contract fixes both
/// the field names and the float `ts`, so this is hand-rolled.
pub struct JsonLineFormat;

impl<S, N> FormatEvent<S, N> for JsonLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut record = Map::new();
        record.insert(
            "level".to_string(),
            Value::String(level_str(event.metadata().level()).to_string()),
        );
        record.insert("ts".to_string(), unix_ts_value());
        record.insert(
            "logger".to_string(),
            Value::String(event.metadata().target().to_string()),
        );
        record.insert(
            "msg".to_string(),
            Value::String(visitor.message.unwrap_or_default()),
        );
        for (key, value) in visitor.fields {
            record.insert(key, value);
        }

        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{}", line)
    }
}

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// Current time as a JSON number of Unix seconds with nanosecond fraction
fn unix_ts_value() -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    serde_json::Number::from_f64(now.as_secs_f64())
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Collects event fields into JSON values, pulling `message` out separately
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, Value)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.push(field.name(), serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.push(field.name(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.push(field.name(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.push(field.name(), serde_json::json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field.name(), Value::String(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.push(field.name(), Value::String(rendered));
        }
    }
}

impl FieldVisitor {
    fn push(&mut self, name: &str, value: Value) {
        self.fields.push((name.to_string(), value));
    }
}
