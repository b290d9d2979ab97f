//! Logging for fleet runs.
//!
//! Harness events go through `tracing`. Relayed conductor output is logged
//! with a `peer` field and, when a logs directory is configured, also
//! captured per conductor as JSONL so interleaved runs can be untangled:
//!
//! ```bash
//! # Everything conductor 1 printed on stderr
//! jq 'select(.source == "conductor-1" and .target == "stderr")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::{JsonLogEntry, LogSource, SessionMetadata, Stream};
pub use layer::{init_tracing, JsonlLayer};
pub use writer::{read_entries, write_session_metadata, LogWriter};
