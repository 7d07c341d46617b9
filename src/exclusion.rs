//! Exclusion matching
//!
//! Decides whether a path below the backup root is left out of the archive.
//! Patterns are written relative to the root, optionally starting with `./`,
//! always with forward slashes:
//!
//! | Pattern            | Kind        | Excludes                                     |
//! |--------------------|-------------|----------------------------------------------|
//! | `./**/*.sock`      | extension   | any entry whose name ends with `.sock`       |
//! | `./**/node_modules`| any segment | any entry with a `node_modules` component    |
//! | `./.cache`         | prefix      | `.cache` and everything below it             |
//! | `./Library/*/Logs` | glob        | matching entries and everything below them   |
//!
//! A trailing `/` restricts a pattern to directories. `{user}` is replaced by
//! the username when the set is built. Patterns that fail to compile are
//! reported to telemetry and dropped; they never abort a run.
//!
//! Matching is a pure function of the pattern set, the path and the entry
//! type. A match on a directory tells the walker to prune the subtree.
//!
//! ## Example
//!
//! ```rust
//! use backup_home::exclusion::{ExclusionRules, ExclusionSet};
//! use std::path::Path;
//!
//! let set = ExclusionSet::builder()
//!     .pattern("./**/node_modules")
//!     .pattern("./**/*.sock")
//!     .build()
//!     .unwrap();
//!
//! assert!(set.is_excluded(Path::new("a/node_modules/x.txt"), false));
//! assert!(set.is_excluded(Path::new("run/foo.sock"), false));
//! assert!(!set.is_excluded(Path::new("run/foo.sock.bak"), false));
//! ```

use crate::error::{BackupError, Result};
use crate::platform::{self, Platform};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::utils;
use globset::{GlobBuilder, GlobMatcher};
use std::fmt;
use std::path::Path;

/// Capability deciding which entries are left out of the archive
pub trait ExclusionRules: Send + Sync + fmt::Debug {
    /// Whether the entry at `relative` (relative to the backup root) is excluded
    fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool;

    /// Human-readable description used in the run plan
    fn describe(&self) -> String;
}

/// Rules that exclude nothing ("ignore excludes" mode)
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeEverything;

impl ExclusionRules for IncludeEverything {
    fn is_excluded(&self, _relative: &Path, _is_dir: bool) -> bool {
        false
    }

    fn describe(&self) -> String {
        "none (excludes ignored)".to_string()
    }
}

/// One matcher for a single pattern segment
#[derive(Debug, Clone)]
enum Segment {
    /// `**`: zero or more path segments
    AnyDepth,
    /// Segment without wildcards
    Literal(String),
    /// Segment with `*`, `?`, `[..]` or `{..}`
    Wild(GlobMatcher),
}

#[derive(Debug, Clone)]
enum PatternKind {
    /// `*.ext`, optionally behind `**/`: suffix of the final segment
    Extension(String),
    /// `**/name`: any segment equal to `name`
    AnySegment(String),
    /// Literal path from the root, matched at segment boundaries
    Prefix(Vec<String>),
    /// Anything else with wildcards
    Glob(Vec<Segment>),
}

/// A compiled exclusion pattern
#[derive(Debug, Clone)]
pub struct ExclusionPattern {
    raw: String,
    kind: PatternKind,
    dir_only: bool,
    case_insensitive: bool,
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

fn fold(s: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

impl ExclusionPattern {
    /// Compile `raw` after placeholder expansion
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidPattern`] if the pattern is empty or a
    ///   wildcard segment is not a valid glob
    pub fn parse(raw: &str, username: &str, case_insensitive: bool) -> Result<Self> {
        let expanded = platform::expand_user(raw, username).replace('\\', "/");
        let dir_only = expanded.ends_with('/');
        let segments: Vec<&str> = expanded
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();

        let invalid = |reason: &str| BackupError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let Some((last, leading)) = segments.split_last() else {
            return Err(invalid("pattern selects the backup root"));
        };
        if segments.iter().all(|s| *s == "**") {
            return Err(invalid("pattern matches every entry"));
        }

        let kind = if last.starts_with("*.")
            && !has_wildcard(&last[1..])
            && leading.iter().all(|s| *s == "**")
        {
            PatternKind::Extension(fold(&last[1..], case_insensitive))
        } else if leading.len() == 1 && leading[0] == "**" && !has_wildcard(last) {
            PatternKind::AnySegment(fold(last, case_insensitive))
        } else if !segments.iter().any(|s| has_wildcard(s)) {
            PatternKind::Prefix(segments.iter().map(|s| fold(s, case_insensitive)).collect())
        } else {
            let mut compiled = Vec::with_capacity(segments.len());
            for segment in &segments {
                compiled.push(if *segment == "**" {
                    Segment::AnyDepth
                } else if has_wildcard(segment) {
                    let glob = GlobBuilder::new(segment)
                        .case_insensitive(case_insensitive)
                        .literal_separator(true)
                        .build()
                        .map_err(|e| invalid(&e.to_string()))?;
                    Segment::Wild(glob.compile_matcher())
                } else {
                    Segment::Literal(fold(segment, case_insensitive))
                });
            }
            PatternKind::Glob(compiled)
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
            dir_only,
            case_insensitive,
        })
    }

    /// Pattern text as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern only applies to directories
    pub fn is_dir_only(&self) -> bool {
        self.dir_only
    }

    /// Match against a path already split into forward-slash segments
    fn matches(&self, segments: &[&str], is_dir: bool) -> bool {
        if segments.is_empty() {
            return false;
        }
        let folded: Vec<String> = segments
            .iter()
            .map(|s| fold(s, self.case_insensitive))
            .collect();
        let last = folded.len() - 1;

        // A match on a proper ancestor always names a directory; a match on
        // the entry itself must respect the directories-only flag.
        let whole_ok = is_dir || !self.dir_only;

        match &self.kind {
            PatternKind::Extension(suffix) => whole_ok && folded[last].ends_with(suffix.as_str()),
            PatternKind::AnySegment(name) => folded
                .iter()
                .enumerate()
                .any(|(i, seg)| seg == name && (i < last || whole_ok)),
            PatternKind::Prefix(parts) => {
                folded.len() >= parts.len()
                    && folded.iter().zip(parts).all(|(a, b)| a == b)
                    && (folded.len() > parts.len() || whole_ok)
            }
            PatternKind::Glob(pattern) => {
                (1..folded.len()).any(|k| glob_match(pattern, &folded[..k], segments))
                    || (whole_ok && glob_match(pattern, &folded, segments))
            }
        }
    }
}

/// Match `pattern` against all of `path`
///
/// Walks both sequences with two cursors. Only `**` records a backtrack
/// point; a mismatch after it resumes one path segment further along.
/// Literal segments compare against the case-folded path, wildcard segments
/// against the original text (the glob handles case itself).
fn glob_match(pattern: &[Segment], path: &[String], original: &[&str]) -> bool {
    let (mut p, mut s) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while s < path.len() {
        if let Some(segment) = pattern.get(p) {
            match segment {
                Segment::AnyDepth => {
                    backtrack = Some((p + 1, s));
                    p += 1;
                    continue;
                }
                Segment::Literal(lit) if *lit == path[s] => {
                    p += 1;
                    s += 1;
                    continue;
                }
                Segment::Wild(glob) if glob.is_match(original[s]) => {
                    p += 1;
                    s += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((resume, start)) => {
                p = resume;
                s = start + 1;
                backtrack = Some((resume, start + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|seg| matches!(seg, Segment::AnyDepth))
}

impl fmt::Display for ExclusionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A fixed set of exclusion patterns
///
/// Built once at startup and immutable afterwards. Any matching pattern
/// excludes; there is no ordering or negation.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<ExclusionPattern>,
}

impl ExclusionSet {
    /// Start building a set
    pub fn builder() -> ExclusionSetBuilder {
        ExclusionSetBuilder::default()
    }

    /// Default set for `platform`, with invalid patterns reported to `telemetry`
    pub fn for_platform(platform: Platform, username: &str, telemetry: &dyn Telemetry) -> Self {
        Self::builder()
            .platform(platform)
            .username(username)
            .patterns(platform.default_excludes().iter().copied())
            .build_lenient(telemetry)
    }

    /// Compiled patterns
    pub fn patterns(&self) -> &[ExclusionPattern] {
        &self.patterns
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set has no patterns
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl ExclusionRules for ExclusionSet {
    fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        let normalized = utils::to_slash(relative);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        self.patterns.iter().any(|p| p.matches(&segments, is_dir))
    }

    fn describe(&self) -> String {
        if self.patterns.is_empty() {
            return "no patterns".to_string();
        }
        self.patterns
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builder for [`ExclusionSet`]
#[derive(Debug, Clone)]
pub struct ExclusionSetBuilder {
    raw: Vec<String>,
    username: String,
    case_insensitive: bool,
}

impl Default for ExclusionSetBuilder {
    fn default() -> Self {
        Self {
            raw: Vec::new(),
            username: platform::current_username(),
            case_insensitive: Platform::current().case_insensitive(),
        }
    }
}

impl ExclusionSetBuilder {
    /// Add one pattern
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.raw.push(pattern.into());
        self
    }

    /// Add several patterns
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Username substituted for `{user}`
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Take case sensitivity from `platform`
    pub fn platform(mut self, platform: Platform) -> Self {
        self.case_insensitive = platform.case_insensitive();
        self
    }

    /// Force case-insensitive matching on or off
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    /// Compile every pattern, failing on the first invalid one
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidPattern`] for the first pattern that fails
    pub fn build(self) -> Result<ExclusionSet> {
        let patterns = self
            .raw
            .iter()
            .map(|raw| ExclusionPattern::parse(raw, &self.username, self.case_insensitive))
            .collect::<Result<Vec<_>>>()?;
        Ok(ExclusionSet { patterns })
    }

    /// Compile every pattern, dropping invalid ones after reporting them
    pub fn build_lenient(self, telemetry: &dyn Telemetry) -> ExclusionSet {
        let mut patterns = Vec::with_capacity(self.raw.len());
        for raw in &self.raw {
            match ExclusionPattern::parse(raw, &self.username, self.case_insensitive) {
                Ok(pattern) => patterns.push(pattern),
                Err(BackupError::InvalidPattern { pattern, reason }) => {
                    telemetry.record(TelemetryEvent::PatternRejected { pattern, reason });
                }
                Err(other) => telemetry.record(TelemetryEvent::PatternRejected {
                    pattern: raw.clone(),
                    reason: other.to_string(),
                }),
            }
        }
        ExclusionSet { patterns }
    }
}
