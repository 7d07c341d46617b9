//! Common types and data structures for backup-home
//!
//! This module contains the data model shared by the walker, the archive
//! encoders and the orchestration layer:
//!
//! - [`SourceEntry`]: one filesystem node discovered during traversal
//! - [`EntryKind`]: regular file, directory or symbolic link
//! - [`ArchiveStats`]: counters collected while building an archive
//! - [`FinishedArchive`]: a closed archive, the only thing the upload leg accepts
//! - [`BackupReport`]: the outcome of a complete run

use crate::archive::ArchiveFormat;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Type of a filesystem node that can be recorded in an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file with content
    File,
    /// Directory (header only)
    Directory,
    /// Symbolic link (header with link target)
    Symlink,
}

impl EntryKind {
    /// Classify a `symlink_metadata` result; `None` for sockets, FIFOs and devices
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            Some(EntryKind::Symlink)
        } else if file_type.is_dir() {
            Some(EntryKind::Directory)
        } else if file_type.is_file() {
            Some(EntryKind::File)
        } else {
            None
        }
    }
}

/// One filesystem node visited during traversal
///
/// A `SourceEntry` is created once by the walker and consumed once by an
/// archive write. It is never mutated after discovery; the size recorded here
/// is the size written into the archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the backup root
    pub relative: PathBuf,
    /// Entry type
    pub kind: EntryKind,
    /// Size in bytes (0 for directories and symlinks)
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Last modification time
    pub modified: SystemTime,
    /// Target of a symbolic link
    pub link_target: Option<PathBuf>,
}

impl SourceEntry {
    /// Build an entry from already-fetched metadata
    pub fn from_metadata(
        path: PathBuf,
        relative: PathBuf,
        kind: EntryKind,
        metadata: &Metadata,
        link_target: Option<PathBuf>,
    ) -> Self {
        let size = match kind {
            EntryKind::File => metadata.len(),
            _ => 0,
        };
        Self {
            path,
            relative,
            kind,
            size,
            mode: utils::get_permissions(metadata),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            link_target,
        }
    }

    /// Name recorded in the archive: relative, forward-slash separated
    pub fn archive_name(&self) -> String {
        utils::to_slash(&self.relative)
    }

    /// Modification time as seconds since the Unix epoch
    pub fn mtime_secs(&self) -> u64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Whether this is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Outcome of writing one regular file into the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWritten {
    /// Header and full content written
    Complete,
    /// Header written, content zero-padded after a source error
    Padded,
    /// Entry dropped from the container after a source error
    Discarded,
}

/// Counters collected while building one archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    /// Regular files written with complete content
    pub files_written: usize,
    /// Regular files whose content was padded after a read error
    pub files_padded: usize,
    /// Regular files omitted after a source error
    pub files_skipped: usize,
    /// Directory headers written
    pub directories: usize,
    /// Symlink headers written
    pub symlinks: usize,
    /// Entries rejected by exclusion rules (subtrees count once)
    pub excluded: usize,
    /// Traversal errors (unreadable directories, vanished entries)
    pub walk_errors: usize,
    /// Sockets, FIFOs and devices left out
    pub special_skipped: usize,
    /// Source bytes fed into the archive
    pub bytes_read: u64,
}

impl ArchiveStats {
    /// Regular files present in the archive
    pub fn files_in_archive(&self) -> usize {
        self.files_written + self.files_padded
    }

    /// Merge counters collected by another worker
    pub fn merge(&mut self, other: &ArchiveStats) {
        self.files_written += other.files_written;
        self.files_padded += other.files_padded;
        self.files_skipped += other.files_skipped;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.excluded += other.excluded;
        self.walk_errors += other.walk_errors;
        self.special_skipped += other.special_skipped;
        self.bytes_read += other.bytes_read;
    }
}

/// A closed archive file
///
/// Values of this type only come out of the archive phase after the
/// container has been finalized, so the upload leg can never see a file that
/// is still open for writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedArchive {
    /// Location of the archive
    pub path: PathBuf,
    /// Container format
    pub format: ArchiveFormat,
    /// Size on disk in bytes
    pub size: u64,
    /// SHA-256 of the archive file
    pub sha256: String,
    /// Counters from the build (default when an existing file was reused)
    pub stats: ArchiveStats,
    /// Time spent building the archive
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Whether an existing archive was reused instead of built
    pub reused: bool,
}

impl FinishedArchive {
    pub(crate) fn new(
        path: PathBuf,
        format: ArchiveFormat,
        stats: ArchiveStats,
        duration: Duration,
        reused: bool,
    ) -> crate::Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        let sha256 = utils::hash_file_content(&path)?;
        Ok(Self {
            path,
            format,
            size,
            sha256,
            stats,
            duration,
            reused,
        })
    }

    /// Archive file name without directories
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string())
    }

    /// Path of the archive
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Where the archive ended up after the upload phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// Human-readable destination (remote spec or user@host:path)
    pub location: String,
    /// Bytes streamed to the destination
    pub bytes: u64,
    /// Transfer time
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

/// Result of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    /// The archive that was built or reused
    pub archive: FinishedArchive,
    /// Upload outcome, if an upload was performed
    pub upload: Option<UploadReport>,
    /// Whether the local archive is still on disk
    pub local_archive_kept: bool,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
