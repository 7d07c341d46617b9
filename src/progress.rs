//! Progress reporting for byte streams
//!
//! [`ProgressReader`] decorates any [`Read`] implementation. Bytes pass
//! through unchanged; the reader keeps a running total and reports a
//! [`TransferSnapshot`] to the injected telemetry at most once per interval,
//! plus one final snapshot when the expected total is reached (or the source
//! ends early).
//!
//! A stream with an expected total of zero is passed through without any
//! reporting, which avoids dividing by zero in the percentage figure.
//!
//! ## Example
//!
//! ```rust
//! use backup_home::progress::ProgressReader;
//! use backup_home::telemetry::MemoryTelemetry;
//! use std::io::Read;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let data = vec![7u8; 4096];
//! let sink = Arc::new(MemoryTelemetry::new());
//! let mut reader = ProgressReader::new(&data[..], data.len() as u64, "Upload", sink.clone())
//!     .with_interval(Duration::from_secs(5));
//!
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).unwrap();
//! assert_eq!(out, data);
//! assert_eq!(reader.transferred(), 4096);
//! ```

use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default reporting window
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Throughput figures for one point of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// What is being transferred ("Upload", "Sync")
    pub label: String,
    /// Bytes read so far
    pub transferred: u64,
    /// Expected total in bytes
    pub total: u64,
    /// Time since the first byte was requested
    pub elapsed: Duration,
}

impl TransferSnapshot {
    /// Completion in percent; zero for an empty total
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.transferred as f64 * 100.0 / self.total as f64
        }
    }

    /// Bytes transferred in MB
    pub fn transferred_mb(&self) -> f64 {
        utils::to_mb(self.transferred)
    }

    /// Expected total in MB
    pub fn total_mb(&self) -> f64 {
        utils::to_mb(self.total)
    }

    /// Average rate since start in MB/s
    pub fn rate(&self) -> f64 {
        utils::mb_per_sec(self.transferred, self.elapsed)
    }
}

/// Read decorator that reports throughput
pub struct ProgressReader<R> {
    inner: R,
    total: u64,
    transferred: u64,
    label: String,
    interval: Duration,
    started: Instant,
    last_report: Instant,
    completed: bool,
    telemetry: Arc<dyn Telemetry>,
}

impl<R: Read> ProgressReader<R> {
    /// Wrap `inner`, expecting `total` bytes
    pub fn new(
        inner: R,
        total: u64,
        label: impl Into<String>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner,
            total,
            transferred: 0,
            label: label.into(),
            interval: DEFAULT_PROGRESS_INTERVAL,
            started: now,
            last_report: now,
            completed: false,
            telemetry,
        }
    }

    /// Set the minimum time between two progress snapshots
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bytes read through the decorator so far
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Time since the reader was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Unwrap the inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            label: self.label.clone(),
            transferred: self.transferred,
            total: self.total,
            elapsed: self.started.elapsed(),
        }
    }

    fn report(&mut self, eof: bool) {
        if self.total == 0 || self.completed {
            return;
        }
        if self.transferred >= self.total || eof {
            self.completed = true;
            self.telemetry
                .record(TelemetryEvent::TransferCompleted(self.snapshot()));
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_report) >= self.interval {
            self.last_report = now;
            self.telemetry
                .record(TelemetryEvent::TransferProgress(self.snapshot()));
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.transferred += n as u64;
        self.report(n == 0 && !buf.is_empty());
        Ok(n)
    }
}
