//! Source tree traversal
//!
//! [`TreeWalker`] enumerates everything below the backup root exactly once,
//! depth-first, and hands each eligible entry to a visitor closure.
//!
//! ## Rules applied during the walk
//!
//! - **Exclusions**: every entry is checked against the injected
//!   [`ExclusionRules`]. An excluded directory is pruned: the walker never
//!   opens it, so none of its descendants are read.
//! - **Symbolic links** are recorded as links and never followed.
//! - **Special files** (sockets, FIFOs, devices) are skipped.
//! - **Access errors** (unreadable directory, entry vanished between listing
//!   and `lstat`, unreadable link target) are reported and the walk goes on.
//!   A single bad entry never aborts the traversal.
//! - **Skip paths**: paths registered with [`TreeWalker::skip_path`] are
//!   never yielded, which keeps the archive being written out of itself.
//!
//! The visitor controls the walk through [`ControlFlow`]; returning
//! `Break` stops traversal immediately.

use crate::exclusion::ExclusionRules;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::types::{EntryKind, SourceEntry};
use crate::utils;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;
use walkdir::WalkDir;

/// Counters collected by one traversal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Entries handed to the visitor
    pub visited: usize,
    /// Entries matched by an exclusion rule
    pub excluded: usize,
    /// Traversal errors that were reported and skipped
    pub walk_errors: usize,
    /// Special files left out
    pub special_skipped: usize,
    /// Whether the visitor stopped the walk early
    pub interrupted: bool,
}

/// Depth-first walker over a backup root
pub struct TreeWalker {
    root: PathBuf,
    rules: Arc<dyn ExclusionRules>,
    telemetry: Arc<dyn Telemetry>,
    skip: Vec<PathBuf>,
}

impl TreeWalker {
    /// Create a walker for `root`
    ///
    /// The root is canonicalized when possible so skip paths compare reliably.
    pub fn new(root: &Path, rules: Arc<dyn ExclusionRules>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            root: root.canonicalize().unwrap_or_else(|_| root.to_path_buf()),
            rules,
            telemetry,
            skip: Vec::new(),
        }
    }

    /// Never yield the entry at `path`
    pub fn skip_path(mut self, path: &Path) -> Self {
        self.skip.push(canonical_file_path(path));
        self
    }

    /// Root being walked
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk_error(&self, stats: &mut WalkStats, path: Option<PathBuf>, message: String) {
        stats.walk_errors += 1;
        self.telemetry
            .record(TelemetryEvent::WalkError { path, message });
    }

    /// Walk the tree, calling `visit` for every eligible entry
    ///
    /// Directory entries are visited before their children.
    pub fn walk<F>(&self, mut visit: F) -> WalkStats
    where
        F: FnMut(SourceEntry) -> ControlFlow<()>,
    {
        let mut stats = WalkStats::default();
        let mut iter = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .into_iter();

        while let Some(next) = iter.next() {
            let dent = match next {
                Ok(dent) => dent,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf);
                    self.walk_error(&mut stats, path, err.to_string());
                    continue;
                }
            };

            let path = dent.path();
            if self.skip.iter().any(|s| s == path) {
                trace!("Skipping own output {:?}", path);
                continue;
            }

            let relative = match utils::make_relative(path, &self.root) {
                Ok(relative) => relative,
                Err(err) => {
                    self.walk_error(&mut stats, Some(path.to_path_buf()), err.to_string());
                    continue;
                }
            };

            let is_dir = dent.file_type().is_dir();
            if self.rules.is_excluded(&relative, is_dir) {
                stats.excluded += 1;
                self.telemetry
                    .record(TelemetryEvent::EntryExcluded { relative, is_dir });
                if is_dir {
                    iter.skip_current_dir();
                }
                continue;
            }

            let metadata = match dent.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    self.walk_error(&mut stats, Some(path.to_path_buf()), err.to_string());
                    continue;
                }
            };

            let Some(kind) = EntryKind::from_metadata(&metadata) else {
                stats.special_skipped += 1;
                self.telemetry
                    .record(TelemetryEvent::SpecialFileSkipped { relative });
                continue;
            };

            let link_target = if kind == EntryKind::Symlink {
                match fs::read_link(path) {
                    Ok(target) => Some(target),
                    Err(err) => {
                        self.walk_error(&mut stats, Some(path.to_path_buf()), err.to_string());
                        continue;
                    }
                }
            } else {
                None
            };

            self.telemetry.record(TelemetryEvent::EntryVisited {
                relative: relative.clone(),
                kind,
            });
            let entry = SourceEntry::from_metadata(path.to_path_buf(), relative, kind, &metadata, link_target);
            stats.visited += 1;

            if visit(entry).is_break() {
                stats.interrupted = true;
                break;
            }
        }

        stats
    }
}

/// Canonical form of a file path whose file may not exist yet
pub(crate) fn canonical_file_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
