//! Captured log records.
//!
//! One record per line. Records from the harness and from every conductor
//! share a schema so they can be merged and sorted by time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogSource {
    /// The harness's own tracing events
    Harness,
    /// Output relayed from conductor `index`
    Conductor(usize),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Harness => f.write_str("harness"),
            LogSource::Conductor(index) => write!(f, "conductor-{}", index),
        }
    }
}

impl FromStr for LogSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "harness" {
            return Ok(LogSource::Harness);
        }
        s.strip_prefix("conductor-")
            .and_then(|index| index.parse().ok())
            .map(LogSource::Conductor)
            .ok_or_else(|| format!("unknown log source {:?}", s))
    }
}

impl TryFrom<String> for LogSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogSource> for String {
    fn from(source: LogSource) -> Self {
        source.to_string()
    }
}

/// Conductor output stream a relayed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    /// Stderr lines are recorded as warnings
    pub fn level(self) -> &'static str {
        match self {
            Stream::Stdout => "info",
            Stream::Stderr => "warn",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339, millisecond precision
    pub ts: String,
    pub level: String,
    pub source: LogSource,
    /// Module path for harness events, stream name for relayed lines
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Span path, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        source: LogSource,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            source,
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }
}

/// Written once per cluster start to `sessions/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at: String,
    pub conductor_bin: String,
    pub conductors: usize,
    pub cwd: Option<String>,
}

impl SessionMetadata {
    pub fn new(conductor_bin: impl Into<String>, conductors: usize) -> Self {
        let now = chrono::Utc::now();
        Self {
            session_id: now.format("%Y-%m-%dT%H-%M-%S%.3f").to_string(),
            started_at: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            conductor_bin: conductor_bin.into(),
            conductors,
            cwd: std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_names() {
        assert_eq!(LogSource::Conductor(2).to_string(), "conductor-2");
        assert_eq!("harness".parse::<LogSource>(), Ok(LogSource::Harness));
        assert_eq!("conductor-11".parse::<LogSource>(), Ok(LogSource::Conductor(11)));
        assert!("conductor-x".parse::<LogSource>().is_err());
    }

    #[test]
    fn test_relayed_line_shape() {
        let stream = Stream::Stderr;
        let entry = JsonLogEntry::new(
            stream.level(),
            LogSource::Conductor(0),
            stream.as_str(),
            "n3h: bootstrap node unreachable",
        );
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["source"], "conductor-0");
        assert_eq!(json["target"], "stderr");
        assert_eq!(json["level"], "warn");
        assert!(json.get("fields").is_none());

        let back: JsonLogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.source, LogSource::Conductor(0));
    }

    #[test]
    fn test_fields_are_kept() {
        let entry = JsonLogEntry::new("debug", LogSource::Harness, "hcfleet_core::rpc", "RPC call")
            .with_fields(serde_json::json!({ "method": "admin/instance/add", "id": 7 }));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"method\":\"admin/instance/add\""));
        assert!(json.contains("\"id\":7"));
    }
}
