//! On-disk layout of captured logs.
//!
//! ```text
//! logs/
//! ├── raw/
//! │   ├── 2026-10-19_harness.jsonl
//! │   ├── 2026-10-19_conductor-0.jsonl
//! │   └── 2026-10-19_conductor-1.jsonl
//! └── sessions/
//!     └── 2026-10-19T09-12-03.412.json
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::{JsonLogEntry, LogSource, SessionMetadata, Stream};

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Appends records of one source to its JSONL file
pub struct LogWriter {
    source: LogSource,
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl LogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, source: LogSource) -> io::Result<Self> {
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;
        let path = raw_dir.join(format!(
            "{}_{}.jsonl",
            chrono::Local::now().format("%Y-%m-%d"),
            source
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            source,
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn for_conductor(logs_dir: impl AsRef<Path>, index: usize) -> io::Result<Self> {
        Self::new(logs_dir, LogSource::Conductor(index))
    }

    pub fn source(&self) -> LogSource {
        self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush, so a killed run loses nothing.
    pub fn write(&self, entry: &JsonLogEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry).map_err(invalid_data)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()
    }

    /// Record a line the conductor printed on `stream`.
    pub fn relay(&self, stream: Stream, line: &str) -> io::Result<()> {
        self.write(&JsonLogEntry::new(stream.level(), self.source, stream.as_str(), line))
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.file.lock().flush();
    }
}

pub fn write_session_metadata(
    logs_dir: impl AsRef<Path>,
    metadata: &SessionMetadata,
) -> io::Result<PathBuf> {
    let sessions_dir = logs_dir.as_ref().join("sessions");
    fs::create_dir_all(&sessions_dir)?;

    let path = sessions_dir.join(format!("{}.json", metadata.session_id));
    fs::write(
        &path,
        serde_json::to_string_pretty(metadata).map_err(invalid_data)?,
    )?;
    Ok(path)
}

/// Captured records in time order, optionally limited to one source.
/// Lines that do not parse are skipped.
pub fn read_entries(
    logs_dir: impl AsRef<Path>,
    source: Option<LogSource>,
) -> io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for item in fs::read_dir(&raw_dir)? {
        let path = item?.path();
        if path.extension().map_or(true, |ext| ext != "jsonl") {
            continue;
        }
        for line in fs::read_to_string(&path)?.lines() {
            let Ok(entry) = serde_json::from_str::<JsonLogEntry>(line.trim()) else {
                continue;
            };
            if source.map_or(true, |s| s == entry.source) {
                entries.push(entry);
            }
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
