//! Backup job orchestration
//!
//! A [`BackupJob`] runs the two phases of a backup in order:
//!
//! 1. **Archive**: walk the source tree and build one compressed archive
//!    (or reuse an archive that already exists at the output path).
//! 2. **Upload**: copy the closed archive to the configured destination.
//!
//! Each phase fails with a single wrapped error ([`BackupError::ArchiveFailed`]
//! or [`BackupError::UploadFailed`]). The local archive is deleted only after
//! a confirmed upload, and only when it is not explicitly kept.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backup_home::{BackupBuilder, UploadMode};
//!
//! # fn main() -> backup_home::Result<()> {
//! let job = BackupBuilder::new("/home/alice")
//!     .compression_level(9)
//!     .upload(UploadMode::Sync { destination: "drive:backups".into() })
//!     .build()?;
//!
//! println!("{}", job.plan());
//! let report = job.run()?;
//! println!("archived {} files", report.archive.stats.files_in_archive());
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveFormat;
use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::exclusion::{ExclusionRules, ExclusionSet, IncludeEverything};
use crate::pipeline::{ArchivePipeline, FileOpener, StdFileOpener};
use crate::platform::{self, Platform};
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::telemetry::{Telemetry, TelemetryEvent, TracingTelemetry};
use crate::transfer::{RemoteCopy, UploadMode};
use crate::types::{ArchiveStats, BackupReport, FinishedArchive, UploadReport};
use crate::utils;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Builder for [`BackupJob`]
///
/// Defaults:
/// - output: `<temp dir>/<username>.<ext>` for the platform
/// - compression level: 6 (values outside 0-9 fall back to 6)
/// - workers: number of CPU cores, queue capacity twice that
/// - progress interval: 5 seconds
/// - skip on error: on
/// - exclusions: platform defaults
/// - existing archive at the output path: reused
/// - upload: none
pub struct BackupBuilder {
    source: PathBuf,
    output: Option<PathBuf>,
    level: i64,
    workers: usize,
    queue_capacity: Option<usize>,
    progress_interval: Duration,
    ignore_excludes: bool,
    skip_on_error: bool,
    keep_backup: bool,
    overwrite: bool,
    extra_patterns: Vec<String>,
    platform: Platform,
    username: Option<String>,
    upload: UploadMode,
    remote: Option<Arc<dyn RemoteCopy>>,
    telemetry: Arc<dyn Telemetry>,
    opener: Arc<dyn FileOpener>,
}

impl BackupBuilder {
    /// Back up the directory at `source`
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: None,
            level: i64::from(CompressionLevel::DEFAULT.get()),
            workers: num_cpus::get(),
            queue_capacity: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            ignore_excludes: false,
            skip_on_error: true,
            keep_backup: false,
            overwrite: false,
            extra_patterns: Vec::new(),
            platform: Platform::current(),
            username: None,
            upload: UploadMode::None,
            remote: None,
            telemetry: TracingTelemetry::shared(),
            opener: Arc::new(StdFileOpener),
        }
    }

    /// Archive location
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Raw compression level; anything outside 0-9 becomes 6
    pub fn compression_level(mut self, level: i64) -> Self {
        self.level = level;
        self
    }

    /// Number of file workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Capacity of the file queue between walker and workers
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Interval between progress reports
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Archive everything, ignoring all exclusion patterns
    pub fn ignore_excludes(mut self, yes: bool) -> Self {
        self.ignore_excludes = yes;
        self
    }

    /// Skip unreadable files instead of failing the run
    pub fn skip_on_error(mut self, yes: bool) -> Self {
        self.skip_on_error = yes;
        self
    }

    /// Keep the local archive after a successful upload
    pub fn keep_backup(mut self, yes: bool) -> Self {
        self.keep_backup = yes;
        self
    }

    /// Rebuild the archive even if one exists at the output path
    pub fn overwrite(mut self, yes: bool) -> Self {
        self.overwrite = yes;
        self
    }

    /// Add an exclusion pattern on top of the platform defaults
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.extra_patterns.push(pattern.into());
        self
    }

    /// Use the archive format and default exclusions of `platform`
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Username for the default output name and `{user}` patterns
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Where the archive goes after it is built
    pub fn upload(mut self, mode: UploadMode) -> Self {
        self.upload = mode;
        self
    }

    /// Upload with a custom adapter instead of the one [`UploadMode`] selects
    pub fn remote(mut self, remote: Arc<dyn RemoteCopy>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Telemetry sink for every component of the job
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Source file opener
    pub fn opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Validate the settings and compile the exclusion rules
    ///
    /// Invalid exclusion patterns are reported and dropped, never fatal.
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] for a zero worker count, an
    ///   empty sync destination, an SSH upload without a host, or an output
    ///   path that is a directory
    pub fn build(self) -> Result<BackupJob> {
        if self.workers == 0 {
            return Err(BackupError::config("worker count must be at least 1"));
        }
        if self.queue_capacity == Some(0) {
            return Err(BackupError::config("queue capacity must be at least 1"));
        }
        match &self.upload {
            UploadMode::Sync { destination } if destination.trim().is_empty() => {
                return Err(BackupError::config("sync destination is empty"));
            }
            UploadMode::Secure(ssh) if ssh.host.trim().is_empty() => {
                return Err(BackupError::config("SSH host is required for SFTP uploads"));
            }
            _ => {}
        }

        let username = self.username.unwrap_or_else(platform::current_username);
        let output = self
            .output
            .unwrap_or_else(|| self.platform.default_output_path(&username));
        if output.is_dir() {
            return Err(BackupError::config(format!(
                "output path {:?} is a directory",
                output
            )));
        }

        let (rules, exclusions): (Arc<dyn ExclusionRules>, String) = if self.ignore_excludes {
            (Arc::new(IncludeEverything), "disabled".to_string())
        } else {
            let set = ExclusionSet::builder()
                .platform(self.platform)
                .username(username.as_str())
                .patterns(self.platform.default_excludes().iter().copied())
                .patterns(self.extra_patterns.iter().cloned())
                .build_lenient(self.telemetry.as_ref());
            let summary = format!(
                "{} patterns ({} defaults, {} extra)",
                set.len(),
                self.platform,
                self.extra_patterns.len()
            );
            (Arc::new(set), summary)
        };
        debug!("Exclusion rules: {}", rules.describe());

        Ok(BackupJob {
            source: self.source,
            output,
            format: self.platform.archive_format(),
            level: CompressionLevel::new(self.level),
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            progress_interval: self.progress_interval,
            skip_on_error: self.skip_on_error,
            keep_backup: self.keep_backup,
            overwrite: self.overwrite,
            rules,
            exclusions,
            upload: self.upload,
            remote: self.remote,
            telemetry: self.telemetry,
            opener: self.opener,
        })
    }
}

/// A validated backup run
pub struct BackupJob {
    source: PathBuf,
    output: PathBuf,
    format: ArchiveFormat,
    level: CompressionLevel,
    workers: usize,
    queue_capacity: Option<usize>,
    progress_interval: Duration,
    skip_on_error: bool,
    keep_backup: bool,
    overwrite: bool,
    rules: Arc<dyn ExclusionRules>,
    exclusions: String,
    upload: UploadMode,
    remote: Option<Arc<dyn RemoteCopy>>,
    telemetry: Arc<dyn Telemetry>,
    opener: Arc<dyn FileOpener>,
}

impl fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupJob")
            .field("source", &self.source)
            .field("output", &self.output)
            .field("format", &self.format)
            .field("level", &self.level)
            .field("workers", &self.workers)
            .field("skip_on_error", &self.skip_on_error)
            .field("keep_backup", &self.keep_backup)
            .field("overwrite", &self.overwrite)
            .field("exclusions", &self.exclusions)
            .field("upload", &self.upload)
            .finish()
    }
}

impl BackupJob {
    /// Directory being backed up
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Archive location
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Container format
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Effective compression level
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Exclusion rules applied during the walk
    pub fn rules(&self) -> &Arc<dyn ExclusionRules> {
        &self.rules
    }

    /// Configured upload mode
    pub fn upload_mode(&self) -> &UploadMode {
        &self.upload
    }

    fn phase(&self, message: String) {
        self.telemetry.record(TelemetryEvent::Phase(message));
    }

    fn uploads(&self) -> bool {
        self.remote.is_some() || self.upload.is_enabled()
    }

    /// Build the archive, or reuse the one already at the output path
    ///
    /// # Errors
    ///
    /// Every failure is wrapped in [`BackupError::ArchiveFailed`].
    pub fn create_archive(&self) -> Result<FinishedArchive> {
        self.build_archive().map_err(BackupError::archive_phase)
    }

    fn build_archive(&self) -> Result<FinishedArchive> {
        if !self.source.is_dir() {
            return Err(BackupError::SourceNotFound(self.source.clone()));
        }

        if self.output.exists() && !self.overwrite {
            self.phase(format!(
                "Backup file {} already exists, skipping archive creation",
                self.output.display()
            ));
            return FinishedArchive::new(
                self.output.clone(),
                self.format,
                ArchiveStats::default(),
                Duration::ZERO,
                true,
            );
        }

        self.phase(format!(
            "Creating {} archive of {} at {} (compression {}, {} workers)",
            self.format,
            self.source.display(),
            self.output.display(),
            self.level,
            self.workers
        ));
        let started = Instant::now();
        let mut pipeline = ArchivePipeline::new(
            self.source.clone(),
            self.output.clone(),
            self.format,
            Arc::clone(&self.rules),
            Arc::clone(&self.telemetry),
        )
        .level(self.level)
        .workers(self.workers)
        .skip_on_error(self.skip_on_error)
        .progress_interval(self.progress_interval)
        .opener(Arc::clone(&self.opener));
        if let Some(capacity) = self.queue_capacity {
            pipeline = pipeline.queue_capacity(capacity);
        }
        let stats = pipeline.run()?;

        let archive = FinishedArchive::new(self.output.clone(), self.format, stats, started.elapsed(), false)?;
        self.phase(format!(
            "Archive created: {} files, {}, sha256 {}",
            archive.stats.files_in_archive(),
            utils::format_bytes(archive.size),
            archive.sha256
        ));
        Ok(archive)
    }

    /// Copy `archive` to the configured destination
    ///
    /// Returns `None` when no upload is configured.
    ///
    /// # Errors
    ///
    /// Every failure is wrapped in [`BackupError::UploadFailed`], which names
    /// the preserved local archive.
    pub fn upload(&self, archive: &FinishedArchive) -> Result<Option<UploadReport>> {
        let adapter: Arc<dyn RemoteCopy> = match &self.remote {
            Some(remote) => Arc::clone(remote),
            None => match self
                .upload
                .adapter(Arc::clone(&self.telemetry), self.progress_interval)
            {
                Some(adapter) => Arc::from(adapter),
                None => return Ok(None),
            },
        };

        let report = adapter
            .upload(archive)
            .map_err(|e| BackupError::upload_phase(archive.path.clone(), e))?;
        self.phase(format!(
            "Backup uploaded to {}: {:.2} MB ({:.2} MB/s)",
            report.location,
            utils::to_mb(report.bytes),
            utils::mb_per_sec(report.bytes, report.duration)
        ));
        Ok(Some(report))
    }

    /// Run both phases and clean up
    ///
    /// # Errors
    ///
    /// - [`BackupError::ArchiveFailed`]: nothing was uploaded
    /// - [`BackupError::UploadFailed`]: the local archive is still on disk
    pub fn run(&self) -> Result<BackupReport> {
        let archive = self.create_archive()?;
        let upload = self.upload(&archive)?;

        let local_archive_kept = match &upload {
            Some(_) if !self.keep_backup => match fs::remove_file(&archive.path) {
                Ok(()) => {
                    self.phase(format!("Removed local archive {}", archive.path.display()));
                    false
                }
                Err(err) => {
                    self.telemetry.record(TelemetryEvent::Warning(format!(
                        "failed to remove local archive {}: {}",
                        archive.path.display(),
                        err
                    )));
                    true
                }
            },
            _ => {
                self.phase(format!("Backup kept at {}", archive.path.display()));
                true
            }
        };

        Ok(BackupReport {
            archive,
            upload,
            local_archive_kept,
        })
    }

    /// What [`run`](Self::run) would do, without touching the filesystem
    pub fn plan(&self) -> BackupPlan {
        let mut steps = vec![format!(
            "Create {} archive of {} at {}",
            self.format,
            self.source.display(),
            self.output.display()
        )];
        if self.uploads() {
            let destination = match &self.remote {
                Some(remote) => remote.destination(),
                None => self.upload.to_string(),
            };
            steps.push(format!("Upload archive via {}", destination));
            if self.keep_backup {
                steps.push("Keep local archive".to_string());
            } else {
                steps.push("Delete local archive after a successful upload".to_string());
            }
        } else {
            steps.push("Keep archive locally (no upload)".to_string());
        }

        BackupPlan {
            source: self.source.clone(),
            output: self.output.clone(),
            format: self.format,
            compression: self.level.get(),
            exclusions: self.exclusions.clone(),
            upload: self.upload.to_string(),
            reuse_existing: !self.overwrite,
            skip_on_error: self.skip_on_error,
            steps,
        }
    }
}

/// Preview of a backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupPlan {
    /// Directory to back up
    pub source: PathBuf,
    /// Archive location
    pub output: PathBuf,
    /// Container format
    pub format: ArchiveFormat,
    /// Effective compression level
    pub compression: u32,
    /// Exclusion summary
    pub exclusions: String,
    /// Upload destination
    pub upload: String,
    /// Whether an existing archive would be reused
    pub reuse_existing: bool,
    /// Whether unreadable files are skipped
    pub skip_on_error: bool,
    /// Steps in execution order
    pub steps: Vec<String>,
}

impl fmt::Display for BackupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup plan")?;
        writeln!(f, "  Source:       {}", self.source.display())?;
        writeln!(f, "  Archive:      {} ({})", self.output.display(), self.format)?;
        writeln!(f, "  Compression:  level {}", self.compression)?;
        writeln!(f, "  Exclusions:   {}", self.exclusions)?;
        writeln!(f, "  Upload:       {}", self.upload)?;
        writeln!(
            f,
            "  On error:     {}",
            if self.skip_on_error { "skip file" } else { "abort" }
        )?;
        writeln!(f, "Steps:")?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryTelemetry;
    use crate::transfer::SshConfig;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeRemote {
        fail: bool,
        received: Mutex<Vec<PathBuf>>,
    }

    impl RemoteCopy for FakeRemote {
        fn upload(&self, archive: &FinishedArchive) -> Result<UploadReport> {
            assert!(archive.path.exists());
            self.received.lock().push(archive.path.clone());
            if self.fail {
                return Err(BackupError::Transfer(std::io::Error::other("connection reset")));
            }
            Ok(UploadReport {
                location: format!("fake:{}", archive.file_name()),
                bytes: archive.size,
                duration: Duration::from_millis(1),
            })
        }

        fn destination(&self) -> String {
            "fake:".to_string()
        }
    }

    fn source_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("docs")).unwrap();
        fs::write(temp_dir.path().join("docs/a.txt"), b"alpha").unwrap();
        fs::write(temp_dir.path().join("b.txt"), b"beta").unwrap();
        temp_dir
    }

    fn builder(source: &Path, output: &Path) -> BackupBuilder {
        BackupBuilder::new(source)
            .output(output)
            .platform(Platform::Linux)
            .username("alice")
            .workers(2)
            .telemetry(Arc::new(MemoryTelemetry::new()))
    }

    #[test]
    fn test_build_validation() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("alice.tar.gz");

        assert!(matches!(
            builder(src.path(), &archive).workers(0).build(),
            Err(BackupError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            builder(src.path(), &archive)
                .upload(UploadMode::Sync { destination: " ".into() })
                .build(),
            Err(BackupError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            builder(src.path(), &archive)
                .upload(UploadMode::Secure(SshConfig::new("")))
                .build(),
            Err(BackupError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            builder(src.path(), out.path()).build(),
            Err(BackupError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_out_of_range_level_uses_default() {
        let src = source_tree();
        let job = builder(src.path(), &src.path().join("x.tar.gz"))
            .compression_level(42)
            .build()
            .unwrap();
        assert_eq!(job.level(), CompressionLevel::DEFAULT);
    }

    #[test]
    fn test_default_output_path() {
        let src = source_tree();
        let job = BackupBuilder::new(src.path())
            .platform(Platform::Windows)
            .username("bob")
            .telemetry(Arc::new(MemoryTelemetry::new()))
            .build()
            .unwrap();
        assert_eq!(job.output(), std::env::temp_dir().join("bob.zip"));
        assert_eq!(job.format(), ArchiveFormat::Zip);
    }

    #[test]
    fn test_backup_only_keeps_archive() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");

        let report = builder(src.path(), &path).build().unwrap().run().unwrap();
        assert!(report.upload.is_none());
        assert!(report.local_archive_kept);
        assert!(path.exists());
        assert!(!report.archive.reused);
        assert_eq!(report.archive.stats.files_written, 2);
        assert_eq!(report.archive.sha256.len(), 64);
    }

    #[test]
    fn test_existing_archive_is_reused() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");
        fs::write(&path, b"previous run").unwrap();

        let archive = builder(src.path(), &path).build().unwrap().create_archive().unwrap();
        assert!(archive.reused);
        assert_eq!(fs::read(&path).unwrap(), b"previous run");

        let rebuilt = builder(src.path(), &path)
            .overwrite(true)
            .build()
            .unwrap()
            .create_archive()
            .unwrap();
        assert!(!rebuilt.reused);
        assert_ne!(fs::read(&path).unwrap(), b"previous run");
    }

    #[test]
    fn test_missing_source_is_archive_failure() {
        let out = TempDir::new().unwrap();
        let job = builder(&out.path().join("missing"), &out.path().join("a.tar.gz"))
            .build()
            .unwrap();
        let err = job.run().unwrap_err();
        match err {
            BackupError::ArchiveFailed(inner) => {
                assert!(matches!(*inner, BackupError::SourceNotFound(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_successful_upload_removes_local_archive() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");
        let remote = Arc::new(FakeRemote::default());

        let report = builder(src.path(), &path)
            .remote(remote.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(remote.received.lock().len(), 1);
        assert_eq!(report.upload.unwrap().location, "fake:alice.tar.gz");
        assert!(!report.local_archive_kept);
        assert!(!path.exists());
    }

    #[test]
    fn test_keep_backup_after_upload() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");

        let report = builder(src.path(), &path)
            .remote(Arc::new(FakeRemote::default()))
            .keep_backup(true)
            .build()
            .unwrap()
            .run()
            .unwrap();
        assert!(report.local_archive_kept);
        assert!(path.exists());
    }

    #[test]
    fn test_failed_upload_preserves_archive() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");

        let err = builder(src.path(), &path)
            .remote(Arc::new(FakeRemote {
                fail: true,
                ..Default::default()
            }))
            .build()
            .unwrap()
            .run()
            .unwrap_err();
        assert_eq!(err.preserved_archive(), Some(&path));
        assert!(path.exists());
    }

    #[test]
    fn test_plan_lists_steps() {
        let src = source_tree();
        let out = TempDir::new().unwrap();
        let path = out.path().join("alice.tar.gz");
        let job = builder(src.path(), &path)
            .upload(UploadMode::Sync {
                destination: "drive:backups".into(),
            })
            .build()
            .unwrap();

        let text = job.plan().to_string();
        assert!(text.contains("1. Create tar.gz archive"));
        assert!(text.contains("2. Upload archive via sync tool -> drive:backups"));
        assert!(text.contains("3. Delete local archive after a successful upload"));
        assert!(!path.exists());

        let local = builder(src.path(), &path).ignore_excludes(true).build().unwrap().plan();
        assert_eq!(local.exclusions, "disabled");
        assert_eq!(local.steps.len(), 2);
    }
}
