//! Error types for backup-home
//!
//! This module defines every error a backup run can surface. Errors fall into
//! three groups:
//!
//! - **Fatal**: the output archive cannot be created or finalized, the remote
//!   session cannot be established, or the remote directory/file cannot be
//!   created. These end the current phase.
//! - **Soft**: a single source entry could not be read. The walker and the
//!   workers log these and keep going when skip-on-error is enabled.
//! - **Phase wrappers**: [`BackupError::ArchiveFailed`] and
//!   [`BackupError::UploadFailed`] wrap the underlying cause so the caller can
//!   tell which phase failed.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in backup-home
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors that are not tied to a specific source entry
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization of reports
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backup root does not exist
    #[error("source directory does not exist: {0:?}")]
    SourceNotFound(PathBuf),

    /// The local archive file could not be created
    #[error("failed to create output file {path:?}: {source}")]
    OutputCreate {
        /// Output path
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Closing the compression stream or archive container failed
    #[error("failed to finalize archive: {0}")]
    Finalize(String),

    /// A single source entry could not be read
    #[error("cannot read {path:?}: {source}")]
    Entry {
        /// Absolute path of the entry
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Writing into the archive stream failed
    #[error("failed to write {path:?} into archive: {source}")]
    ArchiveWrite {
        /// Relative path of the entry being written
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Zip container errors
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// SSH protocol errors
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// TCP connection to the SSH server failed
    #[error("failed to connect to SSH server {addr}: {source}")]
    Connect {
        /// host:port
        addr: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// No usable credential, or the server rejected all of them
    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    /// Server identity did not pass the configured host-key policy
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// Remote directory creation failed
    #[error("failed to create remote directory {path}: {source}")]
    RemoteDirectory {
        /// Remote path
        path: String,
        /// Underlying cause
        #[source]
        source: ssh2::Error,
    },

    /// Remote file creation failed
    #[error("failed to create remote file {path}: {source}")]
    RemoteFile {
        /// Remote path
        path: String,
        /// Underlying cause
        #[source]
        source: ssh2::Error,
    },

    /// Streaming bytes to the destination failed
    #[error("failed to transfer file: {0}")]
    Transfer(#[source] std::io::Error),

    /// The sync tool reported failure
    #[error("sync tool failed: {0}")]
    SyncTool(String),

    /// Exclusion pattern that cannot be compiled
    #[error("invalid exclude pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// Pattern text as given
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Archive phase failed
    #[error("failed to create backup: {0}")]
    ArchiveFailed(#[source] Box<BackupError>),

    /// Upload phase failed; the local archive was kept
    #[error("failed to upload backup {archive:?}: {source}")]
    UploadFailed {
        /// Local archive that was preserved
        archive: PathBuf,
        /// Underlying cause
        #[source]
        source: Box<BackupError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a finalization error with a custom message
    pub fn finalize(msg: impl Into<String>) -> Self {
        BackupError::Finalize(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::InvalidConfiguration(msg.into())
    }

    /// Wrap an error as an archive-phase failure
    pub fn archive_phase(err: BackupError) -> Self {
        match err {
            already @ BackupError::ArchiveFailed(_) => already,
            other => BackupError::ArchiveFailed(Box::new(other)),
        }
    }

    /// Wrap an error as an upload-phase failure for `archive`
    pub fn upload_phase(archive: PathBuf, err: BackupError) -> Self {
        match err {
            already @ BackupError::UploadFailed { .. } => already,
            other => BackupError::UploadFailed {
                archive,
                source: Box::new(other),
            },
        }
    }

    /// Check if the soft-fail policy may swallow this error
    pub fn is_soft(&self) -> bool {
        matches!(self, BackupError::Entry { .. })
    }

    /// Check if this error ends the phase it occurred in
    pub fn is_fatal(&self) -> bool {
        !self.is_soft()
    }

    /// Local archive preserved after an upload failure, if any
    pub fn preserved_archive(&self) -> Option<&PathBuf> {
        match self {
            BackupError::UploadFailed { archive, .. } => Some(archive),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::SourceNotFound(path) => {
                format!("Source directory {:?} does not exist. Pass an existing directory with --source.", path)
            }
            BackupError::Authentication(msg) => {
                format!("{}. Provide --ssh-key or --ssh-password, or place a key in ~/.ssh.", msg)
            }
            BackupError::HostKey(msg) => {
                format!("{}. Check the known_hosts file passed with --known-hosts.", msg)
            }
            BackupError::UploadFailed { archive, source } => {
                format!(
                    "Upload failed: {}. The local archive was kept at {:?}; retry the transfer manually.",
                    source.user_message(),
                    archive
                )
            }
            BackupError::ArchiveFailed(inner) => {
                format!("Archive creation failed: {}", inner.user_message())
            }
            _ => self.to_string(),
        }
    }
}
