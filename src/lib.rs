//! # backup-home - Home directory snapshots
//!
//! Builds one compressed archive of a home directory and ships it to a
//! remote destination.
//!
//! ## Overview
//!
//! A run has two phases:
//! - **Archive**: walk the source tree, drop excluded paths, and write every
//!   remaining entry into a `tar.gz` (POSIX) or `zip` (Windows) container
//! - **Upload**: copy the closed archive with an external sync tool or over
//!   SFTP, then delete the local copy unless asked to keep it
//!
//! ## Architecture
//!
//! - **Exclusion rules**: platform default patterns (`**/node_modules`,
//!   `*.sock`, `./.cache`, ...) compiled once into an [`ExclusionSet`];
//!   excluded directories are pruned, never entered
//! - **Pipeline**: the walker is a single producer feeding a bounded queue;
//!   a pool of worker threads reads files and writes them into the archive
//!   under one lock
//! - **Parallel compression**: gzip output is compressed in independent
//!   blocks on a `rayon` pool and emitted as a multi-member gzip stream
//! - **Telemetry**: every component reports through an injected
//!   [`Telemetry`] sink instead of a global logger
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_home::{BackupBuilder, UploadMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let job = BackupBuilder::new("/home/alice")
//!     .exclude("./Videos")
//!     .upload(UploadMode::Sync { destination: "drive:".into() })
//!     .build()?;
//!
//! let report = job.run()?;
//! println!("{} bytes, sha256 {}", report.archive.size, report.archive.sha256);
//! # Ok(())
//! # }
//! ```
//!
//! ### Archive only, with a custom telemetry sink
//!
//! ```rust,no_run
//! use backup_home::{ArchiveFormat, ArchivePipeline, ExclusionSet, TracingTelemetry};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rules = ExclusionSet::builder().pattern("./**/target").build()?;
//! let stats = ArchivePipeline::new(
//!     "./project",
//!     "/tmp/project.tar.gz",
//!     ArchiveFormat::TarGz,
//!     Arc::new(rules),
//!     TracingTelemetry::shared(),
//! )
//! .workers(4)
//! .run()?;
//! println!("{} files", stats.files_in_archive());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, BackupError>`. Per-file problems during
//! archiving are soft: they are reported and the file is skipped unless
//! skip-on-error is off. Everything else ends the phase it happened in, and
//! [`BackupJob::run`] reports it as either [`BackupError::ArchiveFailed`] or
//! [`BackupError::UploadFailed`].
//!
//! ## Module Organization
//!
//! - [`backup`]: job configuration and the two-phase run
//! - [`exclusion`]: pattern compilation and matching
//! - [`platform`]: per-platform formats, default patterns and output paths
//! - [`walker`]: pruning tree traversal
//! - [`pipeline`]: producer/consumer archive builder
//! - [`archive`]: `tar.gz` and `zip` writers
//! - [`compression`]: levels and the parallel gzip encoder
//! - [`progress`]: throughput-reporting reader
//! - [`transfer`]: sync tool and SFTP uploads
//! - [`telemetry`]: event sink abstraction
//! - [`types`]: shared data types
//! - [`error`]: error types

// Public API modules
pub mod archive;
pub mod backup;
pub mod compression;
pub mod error;
pub mod exclusion;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod telemetry;
pub mod transfer;
pub mod types;
pub mod walker;

// Internal modules (not part of public API)
mod buffer_pool;
pub mod utils;

// Re-export main types for convenience
pub use archive::{ArchiveFormat, ArchiveWriter};
pub use backup::{BackupBuilder, BackupJob, BackupPlan};
pub use compression::CompressionLevel;
pub use error::{BackupError, Result};
pub use exclusion::{ExclusionRules, ExclusionSet, IncludeEverything};
pub use pipeline::{ArchivePipeline, FileOpener, StdFileOpener};
pub use platform::Platform;
pub use progress::ProgressReader;
pub use telemetry::{MemoryTelemetry, Telemetry, TelemetryEvent, TracingTelemetry};
pub use transfer::{HostKeyPolicy, RemoteCopy, SshConfig, UploadMode};
pub use types::*;
pub use walker::TreeWalker;
