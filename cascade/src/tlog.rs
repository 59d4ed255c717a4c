//! A per-shard timestamp tracing buffer for performance investigation.
//! Call sites record (tag, version, ts_ns) triples with negligible overhead;
//! an explicit flush writes and clears the buffer. There is deliberately no
//! process-wide instance: every shard store owns its own.

use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::CResult;
use crate::object::Version;

/// Well-known trace tags.
pub mod tag {
    pub const ORDERED_PUT_START: u32 = 1;
    pub const ORDERED_PUT_END: u32 = 2;
    pub const ORDERED_REMOVE_START: u32 = 3;
    pub const ORDERED_REMOVE_END: u32 = 4;
    pub const LOG_APPEND_END: u32 = 5;
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct TraceEntry {
    tag: u32,
    version: Version,
    ts_ns: u64,
}

/// The buffer itself. Bounded only by memory; flush regularly when tracing.
pub struct TimestampLogger {
    entries: Mutex<Vec<TraceEntry>>,
    enabled: bool,
}

impl TimestampLogger {
    pub fn new(enabled: bool) -> Self {
        Self { entries: Mutex::new(Vec::new()), enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log(&self, tag: u32, version: Version) {
        if !self.enabled {
            return;
        }
        let ts_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.entries.lock().push(TraceEntry { tag, version, ts_ns });
    }

    /// Writes the buffered entries to `path` as "tag version ts_ns" lines
    /// and clears the buffer.
    pub fn flush(&self, path: &Path) -> CResult<()> {
        let drained: Vec<TraceEntry> = {
            let mut entries = self.entries.lock();
            entries.drain(..).collect()
        };
        let mut file = std::io::BufWriter::new(
            std::fs::OpenOptions::new().create(true).append(true).open(path)?,
        );
        for entry in &drained {
            writeln!(file, "{} {} {}", entry.tag, entry.version, entry.ts_ns)?;
        }
        file.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
