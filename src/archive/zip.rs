//! zip container
//!
//! Each entry is deflated on its own by the `zip` crate. A file whose content
//! could not be read completely is aborted and left out of the central
//! directory instead of being stored with padding.

use super::{ArchiveWriter, SizedReader};
use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::types::{EntryWritten, SourceEntry};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs::File;
use std::io::{self, BufWriter};
use tracing::debug;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipWriter};

const OUTPUT_BUFFER: usize = 256 * 1024;

/// zip container with per-entry deflate
pub struct ZipArchiveWriter {
    zip: ZipWriter<BufWriter<File>>,
    level: CompressionLevel,
}

impl ZipArchiveWriter {
    /// Start a zip container in `file`
    pub fn new(file: File, level: CompressionLevel) -> Self {
        Self {
            zip: ZipWriter::new(BufWriter::with_capacity(OUTPUT_BUFFER, file)),
            level,
        }
    }

    fn options(&self, entry: &SourceEntry) -> SimpleFileOptions {
        // Deflate starts at level 1; level 0 means store.
        let options = if self.level.is_store() {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.level.get())))
        };
        options
            .unix_permissions(entry.mode)
            .last_modified_time(zip_time(entry))
            .large_file(entry.size >= u64::from(u32::MAX))
    }
}

/// DOS timestamp in local time; out-of-range dates fall back to 1980-01-01
fn zip_time(entry: &SourceEntry) -> ::zip::DateTime {
    let local: DateTime<Local> = entry.modified.into();
    u16::try_from(local.year())
        .ok()
        .and_then(|year| {
            ::zip::DateTime::from_date_and_time(
                year,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

impl ArchiveWriter for ZipArchiveWriter {
    fn append_dir(&mut self, entry: &SourceEntry) -> Result<()> {
        let options = self.options(entry);
        self.zip.add_directory(entry.archive_name(), options)?;
        Ok(())
    }

    fn append_symlink(&mut self, entry: &SourceEntry) -> Result<()> {
        let target = entry
            .link_target
            .as_deref()
            .map(crate::utils::to_slash)
            .unwrap_or_default();
        let options = self.options(entry);
        self.zip.add_symlink(entry.archive_name(), target, options)?;
        Ok(())
    }

    fn append_file(&mut self, entry: &SourceEntry, content: &mut SizedReader<'_>) -> Result<EntryWritten> {
        let options = self.options(entry);
        self.zip.start_file(entry.archive_name(), options)?;
        io::copy(content, &mut self.zip).map_err(|source| BackupError::ArchiveWrite {
            path: entry.relative.clone(),
            source,
        })?;

        if content.is_incomplete() {
            self.zip.abort_file()?;
            debug!("Dropped partial zip entry {:?}", entry.relative);
            return Ok(EntryWritten::Discarded);
        }
        Ok(EntryWritten::Complete)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let buffered = self
            .zip
            .finish()
            .map_err(|e| BackupError::finalize(format!("failed to write zip directory: {}", e)))?;
        let file = buffered
            .into_inner()
            .map_err(|e| BackupError::finalize(format!("failed to flush archive: {}", e.error())))?;
        file.sync_all()
            .map_err(|e| BackupError::finalize(format!("failed to sync archive: {}", e)))?;
        Ok(())
    }
}
