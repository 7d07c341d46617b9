//! Utility functions for backup-home
//!
//! Helpers shared across modules:
//!
//! ### File Operations
//! - Archive checksums (SHA-256)
//! - Cross-platform permission bits
//!
//! ### Path Manipulation
//! - Converting absolute paths to root-relative paths
//! - Forward-slash normalization for archive names and pattern matching
//!
//! ### Formatting
//! - Human-readable sizes and throughput

use crate::error::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Bytes in one megabyte as used in progress lines
pub const MB: f64 = 1024.0 * 1024.0;

/// Hash a file's content using SHA-256
///
/// Streams the file through the hasher with a 64KB buffer and returns the
/// digest as a 64-character hexadecimal string.
///
/// # Errors
///
/// - [`BackupError::Io`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Get Unix permissions from metadata
#[cfg(unix)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
///
/// Windows has no mode bits; the read-only attribute and the entry type are
/// mapped onto Unix-like permissions so zip headers carry something sensible.
#[cfg(windows)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Get permissions from metadata (other targets)
#[cfg(not(any(unix, windows)))]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links keep their own path, and
/// only canonicalizes when the lexical strip fails.
///
/// # Errors
///
/// - [`BackupError::Internal`] if the path is not under the base path
/// - [`BackupError::Io`] if canonicalization fails (fallback case only)
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            BackupError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Render a relative path with forward slashes
///
/// `.` components and root/prefix components are dropped, so the result is
/// the same on every platform: `a\b\c.txt` and `./a/b/c.txt` both become
/// `a/b/c.txt`. The backup root itself renders as an empty string.
pub fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::ParentDir => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str("..");
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    // Backslashes can survive on non-Windows hosts when a path was built from
    // a Windows-style string; treat them as separators too.
    if out.contains('\\') {
        out = out.replace('\\', "/");
    }
    out
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Convert a byte count to megabytes
pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB
}

/// Average throughput in MB/s; zero when no time has elapsed
pub fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        to_mb(bytes) / secs
    } else {
        0.0
    }
}
