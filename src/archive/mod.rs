//! Archive encoders
//!
//! An [`ArchiveWriter`] serializes a sequence of entries into one container
//! file. Two containers exist, chosen once per run from the target platform:
//!
//! - [`ArchiveFormat::TarGz`]: tar stream wrapped in multi-core gzip
//!   ([`tar_gz::TarGzWriter`])
//! - [`ArchiveFormat::Zip`]: per-entry deflate ([`zip::ZipArchiveWriter`])
//!
//! The API is sequential: each `append_*` call writes a header and, for
//! regular files, the complete content before returning. Callers that share
//! a writer between threads serialize access to it.
//!
//! ## Content length
//!
//! A header records the file size seen at discovery. File content is fed
//! through a [`SizedReader`], which always yields exactly that many bytes: a
//! file that grew is cut at the recorded size, one that shrank or failed
//! mid-read is padded with zeros. The reader keeps the first source error so
//! the writer can decide whether to keep the padded entry (tar) or drop it
//! (zip).

pub mod tar_gz;
pub mod zip;

use crate::compression::CompressionLevel;
use crate::error::{BackupError, Result};
use crate::types::{EntryWritten, SourceEntry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub use self::tar_gz::TarGzWriter;
pub use self::zip::ZipArchiveWriter;

/// Container format of the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// tar stream compressed with gzip
    #[serde(rename = "tar.gz")]
    TarGz,
    /// zip container with deflated entries
    #[serde(rename = "zip")]
    Zip,
}

impl ArchiveFormat {
    /// File extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }

    /// Create `path` and open a writer for this format
    ///
    /// `threads` is the compression parallelism (0 = all cores).
    ///
    /// # Errors
    ///
    /// - [`BackupError::OutputCreate`] if the file cannot be created
    /// - [`BackupError::Internal`] if the compression pool cannot start
    pub fn create_writer(
        self,
        path: &Path,
        level: CompressionLevel,
        threads: usize,
    ) -> Result<Box<dyn ArchiveWriter>> {
        let file = File::create(path).map_err(|source| BackupError::OutputCreate {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(match self {
            ArchiveFormat::TarGz => Box::new(TarGzWriter::new(file, level, threads)?),
            ArchiveFormat::Zip => Box::new(ZipArchiveWriter::new(file, level)),
        })
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Sequential writer for one archive container
pub trait ArchiveWriter: Send {
    /// Write a directory header
    fn append_dir(&mut self, entry: &SourceEntry) -> Result<()>;

    /// Write a symbolic link header with its target
    fn append_symlink(&mut self, entry: &SourceEntry) -> Result<()>;

    /// Write a regular file header followed by its content
    ///
    /// Errors returned here come from the archive side and are fatal. Source
    /// errors are absorbed by `content` and show up in the returned
    /// [`EntryWritten`].
    fn append_file(&mut self, entry: &SourceEntry, content: &mut SizedReader<'_>) -> Result<EntryWritten>;

    /// Close the container and flush it to disk
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Reader yielding exactly `expected` bytes of a source file
///
/// Serves an already-read `prefix` first, then reads `source`. Once the
/// source fails or ends early, the remainder is zero-filled; reads never
/// return an error.
pub struct SizedReader<'a> {
    prefix: &'a [u8],
    source: &'a mut dyn Read,
    expected: u64,
    produced: u64,
    padded: u64,
    source_done: bool,
    error: Option<io::Error>,
}

impl<'a> SizedReader<'a> {
    /// Wrap `source`, with `prefix` holding bytes already read from it
    pub fn new(prefix: &'a [u8], source: &'a mut dyn Read, expected: u64) -> Self {
        Self {
            prefix,
            source,
            expected,
            produced: 0,
            padded: 0,
            source_done: false,
            error: None,
        }
    }

    /// Bytes handed out so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Zero bytes substituted for missing content
    pub fn padded(&self) -> u64 {
        self.padded
    }

    /// Whether the content handed out differs from the source
    pub fn is_incomplete(&self) -> bool {
        self.error.is_some() || self.padded > 0
    }

    /// Take the recorded source problem, if any
    ///
    /// A short file without a read error is reported as `UnexpectedEof`.
    pub fn take_error(&mut self) -> Option<io::Error> {
        if let Some(err) = self.error.take() {
            return Some(err);
        }
        if self.padded > 0 {
            return Some(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while reading, {} bytes missing", self.padded),
            ));
        }
        None
    }

    fn read_source(&mut self, buf: &mut [u8]) -> usize {
        loop {
            match self.source.read(buf) {
                Ok(0) => {
                    self.source_done = true;
                    return 0;
                }
                Ok(n) => return n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.error = Some(e);
                    self.source_done = true;
                    return 0;
                }
            }
        }
    }
}

impl Read for SizedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.expected - self.produced;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let buf = &mut buf[..want];

        let n = if !self.prefix.is_empty() {
            let n = want.min(self.prefix.len());
            buf[..n].copy_from_slice(&self.prefix[..n]);
            self.prefix = &self.prefix[n..];
            n
        } else if !self.source_done {
            self.read_source(buf)
        } else {
            0
        };

        let n = if n == 0 && self.source_done {
            buf.fill(0);
            self.padded += want as u64;
            want
        } else {
            n
        };

        self.produced += n as u64;
        Ok(n)
    }
}
