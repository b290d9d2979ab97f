//! Error types for fleet orchestration

use thiserror::Error;

/// Errors that can occur while driving a conductor fleet
#[derive(Error, Debug)]
pub enum FleetError {
    /// Conductor process could not be launched
    #[error("Failed to spawn conductor {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// Conductor exited before printing the readiness marker
    #[error("Conductor {index} exited before becoming ready")]
    ExitedBeforeReady { index: usize },

    /// Readiness marker did not appear within the configured timeout
    #[error("Conductor {index} not ready after {waited_ms}ms")]
    ReadyTimeout { index: usize, waited_ms: u64 },

    /// Websocket transport failure
    #[error("Websocket error on {url}: {message}")]
    Transport { url: String, message: String },

    /// The conductor answered a call with an error object
    #[error("RPC `{method}` failed ({code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// Channel went away while a request was in flight
    #[error("Channel {0} closed")]
    ChannelClosed(String),

    /// Data channel did not come back after an interface bounce
    #[error("Channel {url} did not reconnect within {waited_ms}ms")]
    ReconnectTimeout { url: String, waited_ms: u64 },

    /// Conductor sent something we could not interpret
    #[error("Malformed response to `{method}`: {message}")]
    MalformedResponse { method: String, message: String },

    /// Conductor configuration could not be rendered
    #[error("Config serialization error: {0}")]
    ConfigSerialization(#[from] toml::ser::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tree-kill of a conductor process failed
    #[error("Failed to terminate conductor {index}: {message}")]
    Terminate { index: usize, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for the current fleet state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for fleet operations
pub type FleetResult<T> = Result<T, FleetError>;
