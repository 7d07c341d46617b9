//! Producer/consumer archive pipeline
//!
//! Builds one archive from one source tree:
//!
//! ```text
//!  walker (calling thread) ──dirs/symlinks──▶ ┌──────────────────────┐
//!        │                                    │ Mutex<ArchiveWriter> │──▶ output file
//!        └──files──▶ bounded queue ──▶ workers ──header+content──▶ └──────────────────────┘
//!                                                                      ▲
//!                                           size monitor (stat every interval)
//! ```
//!
//! - The walker is the only producer. Directory and symlink headers are
//!   written right away, in discovery order.
//! - Regular files go through a bounded `crossbeam-channel` queue, so the
//!   walker blocks when workers fall behind.
//! - Each worker opens its file and reads the first buffer outside the lock,
//!   then holds the writer lock for the entry's header and full content.
//!   File entries may land in any order relative to each other.
//! - A monitor thread samples the output file size every interval and
//!   reports it; it never touches the write path.
//!
//! ## Errors
//!
//! Source-side failures (open, read, shrink) follow `skip_on_error`: when on,
//! the file is reported and left out (or padded, for tar); when off, the
//! first one aborts the run. Archive-side failures always abort. After an
//! abort the walker stops, workers drain the queue without writing, and the
//! partial output file is left where it is.

use crate::archive::{ArchiveFormat, ArchiveWriter, SizedReader};
use crate::buffer_pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::exclusion::ExclusionRules;
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::telemetry::{ArchiveSnapshot, Telemetry, TelemetryEvent};
use crate::types::{ArchiveStats, EntryKind, EntryWritten, SourceEntry};
use crate::walker::TreeWalker;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, Span};

/// Opens source files for reading
///
/// The default implementation is [`StdFileOpener`]. Other implementations
/// can wrap or replace it, for example to throttle or audit reads.
pub trait FileOpener: Send + Sync + fmt::Debug {
    /// Open `path` for reading
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// Opens files with [`File::open`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOpener;

impl FileOpener for StdFileOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }
}

/// One archive-building run
pub struct ArchivePipeline {
    source: PathBuf,
    output: PathBuf,
    format: ArchiveFormat,
    level: CompressionLevel,
    workers: usize,
    queue_capacity: Option<usize>,
    compression_threads: usize,
    skip_on_error: bool,
    progress_interval: Duration,
    rules: Arc<dyn ExclusionRules>,
    opener: Arc<dyn FileOpener>,
    telemetry: Arc<dyn Telemetry>,
}

impl fmt::Debug for ArchivePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchivePipeline")
            .field("source", &self.source)
            .field("output", &self.output)
            .field("format", &self.format)
            .field("level", &self.level)
            .field("workers", &self.workers)
            .field("skip_on_error", &self.skip_on_error)
            .finish()
    }
}

/// State shared by the producer and the workers
struct Shared<'a> {
    writer: &'a Mutex<Box<dyn ArchiveWriter>>,
    abort: &'a AtomicBool,
    failure: &'a Mutex<Option<BackupError>>,
}

impl Shared<'_> {
    fn fail(&self, err: BackupError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

impl ArchivePipeline {
    /// Pipeline archiving `source` into `output` with default settings
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        format: ArchiveFormat,
        rules: Arc<dyn ExclusionRules>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            format,
            level: CompressionLevel::DEFAULT,
            workers: num_cpus::get(),
            queue_capacity: None,
            compression_threads: 0,
            skip_on_error: true,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            rules,
            opener: Arc::new(StdFileOpener),
            telemetry,
        }
    }

    /// Compression level
    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Number of file workers (minimum 1)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Queue capacity (default: twice the worker count)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    /// Threads used for gzip compression (0 = all cores)
    pub fn compression_threads(mut self, threads: usize) -> Self {
        self.compression_threads = threads;
        self
    }

    /// Whether unreadable files are skipped instead of aborting
    pub fn skip_on_error(mut self, skip: bool) -> Self {
        self.skip_on_error = skip;
        self
    }

    /// Interval between archive size reports
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Source file opener
    pub fn opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Build the archive
    ///
    /// Returns the counters of the run once the container is closed.
    ///
    /// # Errors
    ///
    /// - [`BackupError::SourceNotFound`] if the source is not a directory
    /// - [`BackupError::OutputCreate`] if the output cannot be created
    /// - [`BackupError::Entry`] for the first unreadable file when
    ///   `skip_on_error` is off
    /// - [`BackupError::ArchiveWrite`], [`BackupError::Zip`] or
    ///   [`BackupError::Finalize`] when the archive itself cannot be written
    pub fn run(&self) -> Result<ArchiveStats> {
        if !self.source.is_dir() {
            return Err(BackupError::SourceNotFound(self.source.clone()));
        }

        let started = Instant::now();
        debug!(
            "Creating {} archive of {:?} at {:?} (level {}, {} workers)",
            self.format, self.source, self.output, self.level, self.workers
        );

        let writer = self
            .format
            .create_writer(&self.output, self.level, self.compression_threads)?;
        let writer = Mutex::new(writer);
        let abort = AtomicBool::new(false);
        let failure = Mutex::new(None);
        let shared = Shared {
            writer: &writer,
            abort: &abort,
            failure: &failure,
        };

        let pool = BufferPool::new(DEFAULT_BUFFER_SIZE, self.workers * 2);
        let capacity = self.queue_capacity.unwrap_or(self.workers * 2);
        let walker = TreeWalker::new(&self.source, Arc::clone(&self.rules), Arc::clone(&self.telemetry))
            .skip_path(&self.output);

        let mut stats = thread::scope(|scope| {
            // Worker threads report inside the caller's span.
            let span = Span::current();
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let monitor = {
                let span = span.clone();
                scope.spawn(move || span.in_scope(|| self.monitor_size(stop_rx, started)))
            };

            let (task_tx, task_rx) = bounded::<SourceEntry>(capacity);
            let handles: Vec<_> = (0..self.workers)
                .map(|_| {
                    let rx = task_rx.clone();
                    let pool = pool.clone();
                    let shared = &shared;
                    let span = span.clone();
                    scope.spawn(move || span.in_scope(|| self.worker(rx, pool, shared)))
                })
                .collect();
            drop(task_rx);

            let mut stats = ArchiveStats::default();
            let walk = walker.walk(|entry| {
                if shared.aborted() {
                    return ControlFlow::Break(());
                }
                let written = match entry.kind {
                    EntryKind::Directory => shared.writer.lock().append_dir(&entry).map(|_| stats.directories += 1),
                    EntryKind::Symlink => shared.writer.lock().append_symlink(&entry).map(|_| stats.symlinks += 1),
                    EntryKind::File => {
                        if task_tx.send(entry).is_err() {
                            return ControlFlow::Break(());
                        }
                        Ok(())
                    }
                };
                match written {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        shared.fail(err);
                        ControlFlow::Break(())
                    }
                }
            });
            drop(task_tx);

            stats.excluded = walk.excluded;
            stats.walk_errors = walk.walk_errors;
            stats.special_skipped = walk.special_skipped;

            for handle in handles {
                match handle.join() {
                    Ok(worker_stats) => stats.merge(&worker_stats),
                    Err(_) => shared.fail(BackupError::internal("archive worker panicked")),
                }
            }

            let _ = stop_tx.send(());
            if monitor.join().is_err() {
                debug!("Archive size monitor panicked");
            }
            stats
        });

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        writer.into_inner().finish()?;

        let size = fs::metadata(&self.output)?.len();
        self.telemetry
            .record(TelemetryEvent::ArchiveFinished(ArchiveSnapshot {
                bytes: size,
                elapsed: started.elapsed(),
            }));
        Ok(stats)
    }

    /// Report the output size every interval until told to stop
    fn monitor_size(&self, stop: Receiver<()>, started: Instant) {
        loop {
            match stop.recv_timeout(self.progress_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Ok(metadata) = fs::metadata(&self.output) {
                        self.telemetry
                            .record(TelemetryEvent::ArchiveProgress(ArchiveSnapshot {
                                bytes: metadata.len(),
                                elapsed: started.elapsed(),
                            }));
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Consume file tasks until the queue closes
    fn worker(&self, tasks: Receiver<SourceEntry>, pool: BufferPool, shared: &Shared<'_>) -> ArchiveStats {
        let mut stats = ArchiveStats::default();
        for entry in tasks.iter() {
            if shared.aborted() {
                continue;
            }
            if let Err(err) = self.archive_file(&entry, &pool, shared, &mut stats) {
                shared.fail(err);
            }
        }
        stats
    }

    /// Write one regular file into the archive
    fn archive_file(
        &self,
        entry: &SourceEntry,
        pool: &BufferPool,
        shared: &Shared<'_>,
        stats: &mut ArchiveStats,
    ) -> Result<()> {
        let mut source = match self.opener.open(&entry.path) {
            Ok(source) => source,
            Err(err) => return self.source_failure(entry, err, stats),
        };

        let mut buffer = pool.get();
        let want = buffer.len().min(usize::try_from(entry.size).unwrap_or(usize::MAX));
        let head = match read_head(&mut *source, &mut buffer[..want]) {
            Ok(n) => n,
            Err(err) => return self.source_failure(entry, err, stats),
        };

        let mut content = SizedReader::new(&buffer[..head], &mut *source, entry.size);
        let written = {
            let mut writer = shared.writer.lock();
            writer.append_file(entry, &mut content)?
        };

        let produced = content.produced() - content.padded();
        if let Some(err) = content.take_error() {
            if !self.skip_on_error {
                return Err(BackupError::Entry {
                    path: entry.path.clone(),
                    source: err,
                });
            }
            let reason = err.to_string();
            match written {
                EntryWritten::Padded => {
                    stats.files_padded += 1;
                    stats.bytes_read += produced;
                    self.telemetry.record(TelemetryEvent::EntryPadded {
                        path: entry.path.clone(),
                        reason,
                    });
                }
                _ => {
                    stats.files_skipped += 1;
                    self.telemetry.record(TelemetryEvent::EntrySkipped {
                        path: entry.path.clone(),
                        reason,
                    });
                }
            }
            return Ok(());
        }

        stats.files_written += 1;
        stats.bytes_read += produced;
        Ok(())
    }

    fn source_failure(&self, entry: &SourceEntry, err: io::Error, stats: &mut ArchiveStats) -> Result<()> {
        if !self.skip_on_error {
            return Err(BackupError::Entry {
                path: entry.path.clone(),
                source: err,
            });
        }
        stats.files_skipped += 1;
        self.telemetry.record(TelemetryEvent::EntrySkipped {
            path: entry.path.clone(),
            reason: err.to_string(),
        });
        Ok(())
    }
}

/// Fill `buf` from `source` until it is full or the source ends
fn read_head(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
