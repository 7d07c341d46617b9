//! Remote transfer of finished archives
//!
//! Two mutually exclusive adapters implement [`RemoteCopy`]:
//!
//! - [`SyncToolCopy`]: hands the bytes to an external sync tool (`rclone`
//!   by default) and trusts its exit status
//! - [`SftpCopy`]: opens an SSH session, creates a dated remote directory and
//!   streams the archive into it over SFTP
//!
//! Both read the archive through a [`ProgressReader`](crate::progress::ProgressReader)
//! so throughput is reported the same way. Neither retries, and neither
//! cleans up a partially written remote file.

pub mod sftp;
pub mod sync_tool;

use crate::error::Result;
use crate::telemetry::Telemetry;
use crate::types::{FinishedArchive, UploadReport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use self::sftp::{HostKeyPolicy, SftpCopy, SshConfig};
pub use self::sync_tool::SyncToolCopy;

/// Capability that places a finished archive at a remote destination
pub trait RemoteCopy: Send + Sync {
    /// Copy `archive` to the destination
    fn upload(&self, archive: &FinishedArchive) -> Result<UploadReport>;

    /// Human-readable destination
    fn destination(&self) -> String;
}

/// Where the archive goes after it is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    /// Keep the archive locally
    None,
    /// Copy with the external sync tool to `destination` (e.g. `drive:backups`)
    Sync {
        /// Remote spec understood by the sync tool
        destination: String,
    },
    /// Copy over SFTP
    Secure(SshConfig),
}

impl UploadMode {
    /// Whether an upload happens at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, UploadMode::None)
    }

    /// Build the adapter for this mode
    pub fn adapter(&self, telemetry: Arc<dyn Telemetry>, progress_interval: Duration) -> Option<Box<dyn RemoteCopy>> {
        match self {
            UploadMode::None => None,
            UploadMode::Sync { destination } => Some(Box::new(
                SyncToolCopy::new(destination.clone(), telemetry).with_interval(progress_interval),
            )),
            UploadMode::Secure(config) => Some(Box::new(
                SftpCopy::new(config.clone(), telemetry).with_interval(progress_interval),
            )),
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::None => f.write_str("none (keep locally)"),
            UploadMode::Sync { destination } => write!(f, "sync tool -> {}", destination),
            UploadMode::Secure(config) => write!(f, "sftp -> {}", config.location()),
        }
    }
}
