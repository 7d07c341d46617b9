//! tar.gz container
//!
//! GNU tar headers written by the `tar` crate into a [`ParallelGzEncoder`].
//! Partial file content is kept as a zero-padded entry so the stream stays
//! structurally valid.

use super::{ArchiveWriter, SizedReader};
use crate::compression::{CompressionLevel, CompressionStats, ParallelGzEncoder};
use crate::error::{BackupError, Result};
use crate::types::{EntryWritten, SourceEntry};
use std::fs::File;
use std::io::{self, BufWriter};
use tar::{Builder, EntryType, Header};
use tracing::debug;

const OUTPUT_BUFFER: usize = 256 * 1024;

/// tar stream compressed with multi-core gzip
pub struct TarGzWriter {
    builder: Builder<ParallelGzEncoder<BufWriter<File>>>,
}

impl TarGzWriter {
    /// Start a tar.gz stream in `file`
    pub fn new(file: File, level: CompressionLevel, threads: usize) -> Result<Self> {
        let encoder = ParallelGzEncoder::new(BufWriter::with_capacity(OUTPUT_BUFFER, file), level, threads)?;
        Ok(Self {
            builder: Builder::new(encoder),
        })
    }

    fn header(entry: &SourceEntry, kind: EntryType, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_size(size);
        header.set_mode(entry.mode);
        header.set_mtime(entry.mtime_secs());
        header
    }

    fn write_error(entry: &SourceEntry, source: io::Error) -> BackupError {
        BackupError::ArchiveWrite {
            path: entry.relative.clone(),
            source,
        }
    }
}

impl ArchiveWriter for TarGzWriter {
    fn append_dir(&mut self, entry: &SourceEntry) -> Result<()> {
        let mut header = Self::header(entry, EntryType::Directory, 0);
        self.builder
            .append_data(&mut header, format!("{}/", entry.archive_name()), io::empty())
            .map_err(|e| Self::write_error(entry, e))
    }

    fn append_symlink(&mut self, entry: &SourceEntry) -> Result<()> {
        let target = entry.link_target.clone().unwrap_or_default();
        let mut header = Self::header(entry, EntryType::Symlink, 0);
        self.builder
            .append_link(&mut header, entry.archive_name(), &target)
            .map_err(|e| Self::write_error(entry, e))
    }

    fn append_file(&mut self, entry: &SourceEntry, content: &mut SizedReader<'_>) -> Result<EntryWritten> {
        let mut header = Self::header(entry, EntryType::Regular, entry.size);
        self.builder
            .append_data(&mut header, entry.archive_name(), &mut *content)
            .map_err(|e| Self::write_error(entry, e))?;

        if content.is_incomplete() {
            debug!("Padded {} bytes of {:?}", content.padded(), entry.relative);
            Ok(EntryWritten::Padded)
        } else {
            Ok(EntryWritten::Complete)
        }
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| BackupError::finalize(format!("failed to close tar stream: {}", e)))?;
        let (buffered, stats): (BufWriter<File>, CompressionStats) = encoder.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|e| BackupError::finalize(format!("failed to flush archive: {}", e.error())))?;
        file.sync_all()
            .map_err(|e| BackupError::finalize(format!("failed to sync archive: {}", e)))?;

        debug!(
            "tar.gz closed: {} bytes in, {} bytes out ({} members, ratio {:.2})",
            stats.bytes_in,
            stats.bytes_out,
            stats.members,
            stats.ratio()
        );
        Ok(())
    }
}
