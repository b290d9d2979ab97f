//! Signals pushed by conductors over the instance channel.
//!
//! Raw websocket messages are decoded once into [`Signal`] and broadcast to
//! every subscriber; a [`SignalStream`] filters that broadcast by kind.

use serde_json::Value;
use tokio::sync::broadcast;

/// Kind tag carried in `signal.signal_type`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Internal action trace; only these feed quorum barriers
    Trace,
    Consistency,
    User,
    Other(String),
}

impl SignalKind {
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "Trace" => SignalKind::Trace,
            "Consistency" => SignalKind::Consistency,
            "User" => SignalKind::User,
            other => SignalKind::Other(other.to_string()),
        }
    }
}

/// A decoded conductor signal
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub instance_id: Option<String>,
    /// The traced action for `Trace` signals, the whole signal body otherwise
    pub payload: Value,
}

impl Signal {
    /// Decode `{"signal": {"signal_type": .., ..}, "instance_id": ..}`.
    /// Returns `None` for anything that is not a signal.
    pub fn decode(raw: &Value) -> Option<Self> {
        let body = raw.get("signal")?;
        let kind = SignalKind::from_wire(body.get("signal_type")?.as_str()?);
        let payload = match kind {
            SignalKind::Trace => body.get("action").cloned().unwrap_or(Value::Null),
            _ => body.clone(),
        };

        Some(Self {
            kind,
            instance_id: raw
                .get("instance_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload,
        })
    }

    pub fn is_trace(&self) -> bool {
        self.kind == SignalKind::Trace
    }
}

/// Name of a traced action.
///
/// Accepts both `{"action_type": "Hold", ..}` and the externally tagged
/// `{"Hold": ..}` / `"Hold"` encodings.
pub fn action_type(payload: &Value) -> Option<&str> {
    if let Some(tag) = payload.get("action_type").and_then(Value::as_str) {
        return Some(tag);
    }
    match payload {
        Value::String(tag) => Some(tag),
        Value::Object(map) if map.len() == 1 => map.keys().next().map(String::as_str),
        _ => None,
    }
}

/// True when a trace payload reports that the peer now holds something
/// (an entry or a link aspect).
pub fn is_hold_action(payload: &Value) -> bool {
    action_type(payload)
        .map(|tag| tag.starts_with("Hold"))
        .unwrap_or(false)
}

/// Broadcast subscription filtered to one signal kind
pub struct SignalStream {
    rx: broadcast::Receiver<Signal>,
    kind: Option<SignalKind>,
}

impl SignalStream {
    /// `kind: None` passes every signal through
    pub fn new(rx: broadcast::Receiver<Signal>, kind: Option<SignalKind>) -> Self {
        Self { rx, kind }
    }

    /// Next matching signal; `None` once the channel has shut down.
    pub async fn next(&mut self) -> Option<Signal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => {
                    if self.kind.as_ref().map_or(true, |k| *k == signal.kind) {
                        return Some(signal);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Signal subscriber lagged, signals dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
