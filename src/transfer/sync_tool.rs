//! Upload through an external sync tool
//!
//! The archive is streamed into `rclone rcat <destination>/<file name>`.
//! Success or failure is whatever the tool's exit status says.

use super::RemoteCopy;
use crate::error::{BackupError, Result};
use crate::progress::{ProgressReader, DEFAULT_PROGRESS_INTERVAL};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::types::{FinishedArchive, UploadReport};
use crate::utils;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default sync tool binary
pub const DEFAULT_SYNC_PROGRAM: &str = "rclone";

const READ_BUFFER: usize = 256 * 1024;

/// Copies archives with an external sync tool
pub struct SyncToolCopy {
    program: PathBuf,
    destination: String,
    telemetry: Arc<dyn Telemetry>,
    interval: Duration,
}

impl SyncToolCopy {
    /// Copy to `destination` (e.g. `drive:`, `gdrive:backup/home`)
    pub fn new(destination: impl Into<String>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_SYNC_PROGRAM),
            destination: destination.into(),
            telemetry,
            interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Use a different sync tool binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Progress reporting interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Full remote target for `file_name` under `destination`
///
/// A destination that ends in `:` (remote root) or `/` is used as is;
/// otherwise a `/` separates it from the file name.
pub fn remote_target(destination: &str, file_name: &str) -> String {
    if destination.ends_with(':') || destination.ends_with('/') {
        format!("{}{}", destination, file_name)
    } else {
        format!("{}/{}", destination, file_name)
    }
}

impl RemoteCopy for SyncToolCopy {
    fn upload(&self, archive: &FinishedArchive) -> Result<UploadReport> {
        let target = remote_target(&self.destination, &archive.file_name());
        self.telemetry.record(TelemetryEvent::Phase(format!(
            "Uploading {} to {} with {}",
            archive.path.display(),
            target,
            self.program.display()
        )));

        let file = File::open(&archive.path).map_err(BackupError::Transfer)?;
        let mut child = Command::new(&self.program)
            .arg("rcat")
            .arg(&target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::SyncTool(format!("failed to start {}: {}", self.program.display(), e)))?;

        // Drain stderr concurrently so a chatty tool cannot block on a full pipe.
        let stderr = child.stderr.take();
        let collector = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            text
        });

        let started = Instant::now();
        let copied = match child.stdin.take() {
            Some(mut stdin) => {
                let mut reader = ProgressReader::new(
                    BufReader::with_capacity(READ_BUFFER, file),
                    archive.size,
                    "Upload",
                    Arc::clone(&self.telemetry),
                )
                .with_interval(self.interval);
                io::copy(&mut reader, &mut stdin)
            }
            None => Err(io::Error::other("sync tool stdin unavailable")),
        };

        let status = child.wait().map_err(BackupError::Transfer)?;
        let stderr = collector.join().unwrap_or_default();
        if !status.success() {
            return Err(BackupError::SyncTool(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.trim()
            )));
        }
        let bytes = copied.map_err(BackupError::Transfer)?;
        let duration = started.elapsed();
        debug!("Sync tool finished: {}", stderr.trim());

        self.telemetry.record(TelemetryEvent::Phase(format!(
            "Upload completed: {:.2} MB ({:.2} MB/s) to {}",
            utils::to_mb(bytes),
            utils::mb_per_sec(bytes, duration),
            target
        )));
        Ok(UploadReport {
            location: target,
            bytes,
            duration,
        })
    }

    fn destination(&self) -> String {
        self.destination.clone()
    }
}
