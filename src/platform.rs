//! Per-platform defaults
//!
//! The target operating system decides three things once per run: the archive
//! container, whether exclusion matching ignores case, and which exclusion
//! patterns apply by default. [`Platform::current`] picks the variant for the
//! running binary; tests and callers may override it.

use crate::archive::ArchiveFormat;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Placeholder replaced by the resolved username inside exclusion patterns
pub const USER_PLACEHOLDER: &str = "{user}";

const LINUX_EXCLUDES: &[&str] = &[
    "./**/*.sock",
    "./**/.build",
    "./**/.venv",
    "./**/__worktrees",
    "./**/node_modules",
    "./**/target",
    "./**/{user}.tar.gz",
    "./.Trash",
    "./.cache",
    "./.cargo",
    "./.local/share/Trash",
    "./.npm",
    "./.rustup",
    "./.vscode/extensions",
    "./Downloads",
    "./snap",
    "./go",
];

const MACOS_EXCLUDES: &[&str] = &[
    "./**/*.sock",
    "./**/.DS_Store",
    "./**/.build",
    "./**/.venv",
    "./**/node_modules",
    "./**/target",
    "./**/{user}.tar.gz",
    "./.Trash",
    "./.cache",
    "./.cargo",
    "./.npm",
    "./.rustup",
    "./.vscode/extensions",
    "./Downloads",
    "./Library/Caches",
    "./Library/Logs",
    "./Library/Containers/*/Data/Library/Caches",
    "./Library/Application Support/Code/CachedData",
    "./go",
];

const WINDOWS_EXCLUDES: &[&str] = &[
    "./**/*.tmp",
    "./**/.venv",
    "./**/node_modules",
    "./**/target",
    "./**/{user}.zip",
    "./.cargo",
    "./.rustup",
    "./.vscode/extensions",
    "./AppData/Local/Temp",
    "./AppData/Local/Packages",
    "./AppData/Local/Microsoft/Windows/INetCache",
    "./Downloads",
    "./NTUSER.DAT*",
    "./go",
];

/// Operating system family the backup is produced for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux and other POSIX desktops
    Linux,
    /// macOS
    MacOs,
    /// Windows
    Windows,
    /// Anything else: tar.gz, no default exclusions
    Other,
}

impl Platform {
    /// Platform of the running binary
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    /// Container format used for this platform
    pub fn archive_format(self) -> ArchiveFormat {
        match self {
            Platform::Windows => ArchiveFormat::Zip,
            _ => ArchiveFormat::TarGz,
        }
    }

    /// Whether exclusion patterns ignore case
    pub fn case_insensitive(self) -> bool {
        self == Platform::Windows
    }

    /// Default exclusion patterns, still carrying the `{user}` placeholder
    pub fn default_excludes(self) -> &'static [&'static str] {
        match self {
            Platform::Linux => LINUX_EXCLUDES,
            Platform::MacOs => MACOS_EXCLUDES,
            Platform::Windows => WINDOWS_EXCLUDES,
            Platform::Other => &[],
        }
    }

    /// Default archive location: `<temp dir>/<username>.<ext>`
    pub fn default_output_path(self, username: &str) -> PathBuf {
        env::temp_dir().join(format!("{}.{}", username, self.archive_format().extension()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::Other => "other",
        };
        f.write_str(name)
    }
}

/// Expand the `{user}` placeholder in a pattern
pub fn expand_user(pattern: &str, username: &str) -> String {
    pattern.replace(USER_PLACEHOLDER, username)
}

/// Username of the current process owner
///
/// Reads `USER`, then `USERNAME`, then falls back to the last component of
/// the home directory.
pub fn current_username() -> String {
    let from_env = env::var("USER")
        .ok()
        .or_else(|| env::var("USERNAME").ok());
    resolve_username(from_env, dirs::home_dir().as_deref())
}

fn resolve_username(from_env: Option<String>, home: Option<&Path>) -> String {
    if let Some(name) = from_env.filter(|n| !n.trim().is_empty()) {
        return name;
    }
    home.and_then(|h| h.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "user".to_string())
}
