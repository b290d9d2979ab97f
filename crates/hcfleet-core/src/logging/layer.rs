//! Subscriber setup and the JSONL capture layer.

use std::fmt;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::{JsonLogEntry, LogSource};
use super::writer::LogWriter;

/// Mirrors the harness's tracing events into `raw/<date>_harness.jsonl`
pub struct JsonlLayer {
    writer: LogWriter,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            writer: LogWriter::new(logs_dir, LogSource::Harness)?,
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_ascii_lowercase(),
            LogSource::Harness,
            metadata.target(),
            fields.message.take().unwrap_or_default(),
        );
        if !fields.values.is_empty() {
            entry = entry.with_fields(Value::Object(fields.values));
        }
        let span_path = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name()).collect::<Vec<_>>().join(" > "))
            .filter(|path| !path.is_empty());
        if let Some(path) = span_path {
            entry = entry.with_span(path);
        }

        // A full disk must not fail the run
        let _ = self.writer.write(&entry);
    }
}

/// Collects an event's fields as JSON, splitting off `message`
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (name, value) => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Install the global subscriber.
///
/// Console output always; JSONL capture as well when `logs_dir` is given.
/// `verbose` forces `debug`, otherwise `RUST_LOG` applies with `info` as
/// the fallback. A subscriber that is already installed is left alone.
pub fn init_tracing(verbose: bool, logs_dir: Option<&Path>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let jsonl = logs_dir.and_then(|dir| match JsonlLayer::new(dir) {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("JSONL capture disabled, cannot open {}: {}", dir.display(), e);
            None
        }
    });

    let _ = tracing_subscriber::registry()
        .with(jsonl)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
