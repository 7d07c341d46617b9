//! Multi-core gzip compression for backup-home
//!
//! This module provides the compression side of the tar.gz archive format:
//! a clamped [`CompressionLevel`] and [`ParallelGzEncoder`], a writer that
//! spreads deflate work over several cores.
//!
//! ## Overview
//!
//! A single deflate stream is inherently sequential. To use every core, the
//! encoder cuts the uncompressed stream into fixed-size blocks, compresses a
//! batch of blocks in parallel on a dedicated `rayon` pool, and writes each
//! block as its own gzip member in the original order.
//!
//! ## Format
//!
//! The output is a valid multi-member gzip file (RFC 1952, section 2.2).
//! `gzip -d`, `tar xzf` and [`flate2::read::MultiGzDecoder`] decode it as one
//! continuous stream. Each member costs about 20 bytes of header and trailer,
//! which is negligible at the default block size.
//!
//! ## Examples
//!
//! ```rust
//! use backup_home::compression::{CompressionLevel, ParallelGzEncoder};
//! use flate2::read::MultiGzDecoder;
//! use std::io::{Read, Write};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut encoder = ParallelGzEncoder::new(Vec::new(), CompressionLevel::new(9), 2)?;
//! encoder.write_all(b"hello hello hello hello")?;
//! let (compressed, stats) = encoder.finish()?;
//! assert_eq!(stats.bytes_in, 23);
//!
//! let mut text = String::new();
//! MultiGzDecoder::new(&compressed[..]).read_to_string(&mut text)?;
//! assert_eq!(text, "hello hello hello hello");
//! # Ok(())
//! # }
//! ```

use crate::error::{BackupError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::time::Instant;
use tracing::trace;

/// Uncompressed bytes per gzip member
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Compression level between 0 (store) and 9 (best)
///
/// Out-of-range input is not an error: it silently becomes
/// [`CompressionLevel::DEFAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// Level used when none (or an invalid one) is given
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    /// Fastest level that still compresses
    pub const FASTEST: CompressionLevel = CompressionLevel(1);

    /// Best compression
    pub const BEST: CompressionLevel = CompressionLevel(9);

    /// Clamp a raw level, falling back to the default outside 0..=9
    pub fn new(raw: i64) -> Self {
        if (0..=9).contains(&raw) {
            CompressionLevel(raw as u32)
        } else {
            Self::DEFAULT
        }
    }

    /// Numeric level
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether data is stored without compression
    pub fn is_store(self) -> bool {
        self.0 == 0
    }

    /// Level for `flate2`
    pub fn to_flate2(self) -> Compression {
        Compression::new(self.0)
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompressionStats {
    /// Uncompressed bytes accepted
    pub bytes_in: u64,
    /// Compressed bytes written to the inner writer
    pub bytes_out: u64,
    /// Gzip members emitted
    pub members: usize,
    /// Wall time spent compressing batches, in milliseconds
    pub compression_time_ms: u64,
}

impl CompressionStats {
    /// Output size as a fraction of input size (1.0 when nothing was written)
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// Gzip writer that compresses blocks on several cores
///
/// Bytes are buffered into blocks of `block_size`. Once `threads` blocks are
/// pending they are compressed in parallel and written in order. Call
/// [`finish`](Self::finish) to emit the tail; dropping the encoder discards
/// buffered data.
pub struct ParallelGzEncoder<W: Write> {
    writer: Option<W>,
    level: Compression,
    block_size: usize,
    threads: usize,
    current: Vec<u8>,
    pending: Vec<Vec<u8>>,
    pool: Option<rayon::ThreadPool>,
    stats: CompressionStats,
}

impl<W: Write> fmt::Debug for ParallelGzEncoder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelGzEncoder")
            .field("level", &self.level.level())
            .field("block_size", &self.block_size)
            .field("threads", &self.threads)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<W: Write> ParallelGzEncoder<W> {
    /// Create an encoder using `threads` compression threads (0 = all cores)
    ///
    /// # Errors
    ///
    /// - [`BackupError::Internal`] if the compression thread pool cannot start
    pub fn new(writer: W, level: CompressionLevel, threads: usize) -> Result<Self> {
        Self::with_block_size(writer, level, threads, DEFAULT_BLOCK_SIZE)
    }

    /// Create an encoder with an explicit block size
    pub fn with_block_size(
        writer: W,
        level: CompressionLevel,
        threads: usize,
        block_size: usize,
    ) -> Result<Self> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let block_size = block_size.max(4096);

        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("gzip-{}", i))
                .build()
                .map_err(|e| BackupError::internal(format!("Failed to start compression pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            writer: Some(writer),
            level: level.to_flate2(),
            block_size,
            threads,
            current: Vec::with_capacity(block_size),
            pending: Vec::with_capacity(threads),
            pool,
            stats: CompressionStats::default(),
        })
    }

    fn seal_current(&mut self) {
        if !self.current.is_empty() {
            let block = std::mem::replace(&mut self.current, Vec::with_capacity(self.block_size));
            self.pending.push(block);
        }
    }

    /// Compress and write every pending block
    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let level = self.level;
        let blocks = std::mem::take(&mut self.pending);

        let members: Vec<io::Result<Vec<u8>>> = match &self.pool {
            Some(pool) => pool.install(|| blocks.par_iter().map(|b| gzip_member(b, level)).collect()),
            None => blocks.iter().map(|b| gzip_member(b, level)).collect(),
        };

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("gzip encoder already finished"))?;
        for (block, member) in blocks.iter().zip(members) {
            let member = member?;
            writer.write_all(&member)?;
            self.stats.bytes_out += member.len() as u64;
            self.stats.members += 1;
            trace!("Gzip member: {} -> {} bytes", block.len(), member.len());
        }

        self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
        self.pending = Vec::with_capacity(self.threads);
        Ok(())
    }

    /// Write the remaining data and return the inner writer
    ///
    /// An encoder that never received data still emits one empty member so
    /// the output is a valid gzip file.
    ///
    /// # Errors
    ///
    /// - [`BackupError::Finalize`] if compressing or writing the tail fails
    pub fn finish(mut self) -> Result<(W, CompressionStats)> {
        self.seal_current();
        if self.stats.members == 0 && self.pending.is_empty() {
            self.pending.push(Vec::new());
        }
        self.drain_pending()
            .map_err(|e| BackupError::finalize(format!("failed to close gzip stream: {}", e)))?;

        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| BackupError::finalize("gzip encoder already finished"))?;
        writer
            .flush()
            .map_err(|e| BackupError::finalize(format!("failed to flush gzip stream: {}", e)))?;

        trace!(
            "Gzip stream closed: {} -> {} bytes in {} members",
            self.stats.bytes_in,
            self.stats.bytes_out,
            self.stats.members
        );
        Ok((writer, self.stats.clone()))
    }
}

impl<W: Write> Write for ParallelGzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.current.len();
        let n = room.min(buf.len());
        self.current.extend_from_slice(&buf[..n]);
        self.stats.bytes_in += n as u64;

        if self.current.len() == self.block_size {
            self.seal_current();
            if self.pending.len() >= self.threads {
                self.drain_pending()?;
            }
        }
        Ok(n)
    }

    /// Flushes the inner writer only; buffered blocks are emitted by `finish`
    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

fn gzip_member(block: &[u8], level: Compression) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(block.len() / 2 + 64), level);
    encoder.write_all(block)?;
    encoder.finish()
}
