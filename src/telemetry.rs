//! Telemetry capability for backup-home
//!
//! Components do not log observable events through a process-wide handle.
//! Each one receives an `Arc<dyn Telemetry>` when it is built and reports
//! typed [`TelemetryEvent`]s to it. What happens to the events is up to the
//! implementation:
//!
//! - [`TracingTelemetry`] maps events onto `tracing` levels (the default)
//! - [`MemoryTelemetry`] records events so callers can inspect them afterwards
//!
//! ## Example
//!
//! ```rust
//! use backup_home::telemetry::{MemoryTelemetry, Telemetry, TelemetryEvent};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(MemoryTelemetry::new());
//! sink.record(TelemetryEvent::Phase("archiving".to_string()));
//! assert_eq!(sink.events().len(), 1);
//! ```

use crate::progress::TransferSnapshot;
use crate::types::EntryKind;
use crate::utils;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Size of the archive file at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSnapshot {
    /// Bytes currently on disk
    pub bytes: u64,
    /// Time since archiving started
    pub elapsed: Duration,
}

impl ArchiveSnapshot {
    /// Archive size in megabytes
    pub fn megabytes(&self) -> f64 {
        utils::to_mb(self.bytes)
    }

    /// Average output rate since start in MB/s
    pub fn rate(&self) -> f64 {
        utils::mb_per_sec(self.bytes, self.elapsed)
    }
}

/// Observable events reported by the backup components
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// An entry was reached by the walker and passed the exclusion rules
    EntryVisited {
        /// Path relative to the backup root
        relative: PathBuf,
        /// Entry type
        kind: EntryKind,
    },
    /// An entry matched an exclusion pattern (directories are pruned)
    EntryExcluded {
        /// Path relative to the backup root
        relative: PathBuf,
        /// Whether the entry is a directory
        is_dir: bool,
    },
    /// A source entry was left out after a read error
    EntrySkipped {
        /// Absolute path of the entry
        path: PathBuf,
        /// Error description
        reason: String,
    },
    /// A regular file was archived with zero-filled content after a read error
    EntryPadded {
        /// Absolute path of the entry
        path: PathBuf,
        /// Error description
        reason: String,
    },
    /// A socket, FIFO or device node was ignored
    SpecialFileSkipped {
        /// Path relative to the backup root
        relative: PathBuf,
    },
    /// Traversal could not read a directory or entry
    WalkError {
        /// Offending path, when known
        path: Option<PathBuf>,
        /// Error description
        message: String,
    },
    /// An exclusion pattern could not be compiled and was dropped
    PatternRejected {
        /// Pattern text
        pattern: String,
        /// Why it was rejected
        reason: String,
    },
    /// Periodic archive size sample
    ArchiveProgress(ArchiveSnapshot),
    /// Archive closed
    ArchiveFinished(ArchiveSnapshot),
    /// Periodic transfer sample
    TransferProgress(TransferSnapshot),
    /// All bytes of a transfer were read
    TransferCompleted(TransferSnapshot),
    /// Phase-level status message
    Phase(String),
    /// Non-fatal problem outside the per-entry path
    Warning(String),
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEvent::EntryVisited { relative, kind } => {
                write!(f, "Adding {:?}: {}", kind, relative.display())
            }
            TelemetryEvent::EntryExcluded { relative, is_dir } => {
                if *is_dir {
                    write!(f, "Skipping excluded directory: {}", relative.display())
                } else {
                    write!(f, "Skipping excluded file: {}", relative.display())
                }
            }
            TelemetryEvent::EntrySkipped { path, reason } => {
                write!(f, "Skipping {}: {}", path.display(), reason)
            }
            TelemetryEvent::EntryPadded { path, reason } => {
                write!(f, "Content of {} is incomplete ({}), padded with zeros", path.display(), reason)
            }
            TelemetryEvent::SpecialFileSkipped { relative } => {
                write!(f, "Skipping special file: {}", relative.display())
            }
            TelemetryEvent::WalkError { path: Some(path), message } => {
                write!(f, "Error accessing {}: {}", path.display(), message)
            }
            TelemetryEvent::WalkError { path: None, message } => {
                write!(f, "Traversal error: {}", message)
            }
            TelemetryEvent::PatternRejected { pattern, reason } => {
                write!(f, "Invalid exclude pattern {:?}: {}", pattern, reason)
            }
            TelemetryEvent::ArchiveProgress(s) => {
                write!(f, "Archive size: {:.2} MB ({:.2} MB/s)", s.megabytes(), s.rate())
            }
            TelemetryEvent::ArchiveFinished(s) => write!(
                f,
                "Archive completed: {:.2} MB in {:.1}s ({:.2} MB/s)",
                s.megabytes(),
                s.elapsed.as_secs_f64(),
                s.rate()
            ),
            TelemetryEvent::TransferProgress(s) => write!(
                f,
                "{} progress: {:.1}% ({:.2}/{:.2} MB, {:.2} MB/s)",
                s.label,
                s.percent(),
                s.transferred_mb(),
                s.total_mb(),
                s.rate()
            ),
            TelemetryEvent::TransferCompleted(s) => write!(
                f,
                "{} completed: {:.2} MB ({:.2} MB/s)",
                s.label,
                s.transferred_mb(),
                s.rate()
            ),
            TelemetryEvent::Phase(msg) | TelemetryEvent::Warning(msg) => f.write_str(msg),
        }
    }
}

/// Sink for [`TelemetryEvent`]s
///
/// Implementations must be cheap to call from many worker threads at once.
pub trait Telemetry: Send + Sync {
    /// Report one event
    fn record(&self, event: TelemetryEvent);
}

/// Forwards events to `tracing`
///
/// Per-entry chatter goes to `debug`, soft failures to `warn`, progress and
/// phase messages to `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    /// Shared handle suitable for injection
    pub fn shared() -> Arc<dyn Telemetry> {
        Arc::new(TracingTelemetry)
    }
}

impl Telemetry for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::EntryVisited { .. }
            | TelemetryEvent::EntryExcluded { .. }
            | TelemetryEvent::SpecialFileSkipped { .. } => debug!("{}", event),
            TelemetryEvent::EntrySkipped { .. }
            | TelemetryEvent::EntryPadded { .. }
            | TelemetryEvent::WalkError { .. }
            | TelemetryEvent::PatternRejected { .. }
            | TelemetryEvent::Warning(_) => warn!("{}", event),
            TelemetryEvent::ArchiveProgress(_)
            | TelemetryEvent::ArchiveFinished(_)
            | TelemetryEvent::TransferProgress(_)
            | TelemetryEvent::TransferCompleted(_)
            | TelemetryEvent::Phase(_) => info!("{}", event),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Relative paths of all visited entries, in reporting order
    pub fn visited(&self) -> Vec<PathBuf> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::EntryVisited { relative, .. } => Some(relative.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`
    pub fn count(&self, predicate: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl Telemetry for MemoryTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
