//! Include/exclude glob sets used to select task inputs
//!
//! Patterns are evaluated against paths relative to the project root, always
//! with `/` separators. `*` stays within one path segment, `**` crosses
//! directories and `{a,b}` expands alternatives.

use std::fmt;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{AssetflowError, Result};

/// A named-or-anonymous group of include and exclude globs.
///
/// A path matches when at least one include matches and no exclude does.
/// An empty include list matches nothing.
#[derive(Clone)]
pub struct PatternSet {
    includes: Vec<String>,
    excludes: Vec<String>,
    include_set: GlobSet,
    exclude_set: GlobSet,
}

impl fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternSet")
            .field("includes", &self.includes)
            .field("excludes", &self.excludes)
            .finish_non_exhaustive()
    }
}

impl PatternSet {
    /// Compile a pattern set. Fails on malformed globs and on inline `!`
    /// negations, which belong in `excludes`.
    pub fn new<I, E>(includes: I, excludes: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let includes: Vec<String> = includes.into_iter().map(normalize).collect();
        let excludes: Vec<String> = excludes.into_iter().map(normalize).collect();

        let include_set = build_globset(&includes)?;
        let exclude_set = build_globset(&excludes)?;

        Ok(Self {
            includes,
            excludes,
            include_set,
            exclude_set,
        })
    }

    /// Include patterns, in declaration order
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Exclude patterns, in declaration order
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// Test a root-relative path such as `"src/a.css"`.
    pub fn matches(&self, rel_path: &str) -> bool {
        if self.includes.is_empty() {
            return false;
        }
        let rel_path = rel_path.trim_start_matches("./");
        self.include_set.is_match(rel_path) && !self.exclude_set.is_match(rel_path)
    }

    /// Test a path that may be absolute, relativising it against `root`.
    ///
    /// Relative paths are taken as already root-relative. Absolute paths
    /// outside `root` never match.
    pub fn matches_path(&self, root: &Path, path: &Path) -> bool {
        relative_str(root, path).is_some_and(|rel| self.matches(&rel))
    }

    /// Enumerate matching files under `root`.
    ///
    /// The walk is lazy and starts afresh on every call, so files created
    /// since the last enumeration are seen.
    pub fn files(&self, root: &Path) -> Files<'_> {
        let walker = if self.includes.is_empty() {
            None
        } else {
            Some(
                WalkDir::new(root)
                    .follow_links(true)
                    .sort_by_file_name()
                    .into_iter(),
            )
        };

        Files {
            set: self,
            root: root.to_path_buf(),
            walker,
        }
    }
}

/// Lazy iterator over the files a [`PatternSet`] selects.
pub struct Files<'a> {
    set: &'a PatternSet,
    root: PathBuf,
    walker: Option<walkdir::IntoIter>,
}

impl Iterator for Files<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let walker = self.walker.as_mut()?;
        loop {
            let entry = match walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(rel) = relative_str(&self.root, entry.path()) {
                if self.set.matches(&rel) {
                    return Some(entry.into_path());
                }
            }
        }
    }
}

/// Express `path` relative to `root` with `/` separators.
///
/// Relative inputs are returned unchanged (normalised). Returns `None` for
/// absolute paths outside `root`.
pub fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let rel = if path.is_absolute() {
        match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => {
                let canonical = root.canonicalize().ok()?;
                path.strip_prefix(canonical).ok()?
            }
        }
    } else {
        path
    };

    let rel = rel.to_string_lossy().replace('\\', "/");
    Some(rel.trim_start_matches("./").to_string())
}

fn normalize(pattern: impl Into<String>) -> String {
    let pattern = pattern.into();
    pattern.trim_start_matches("./").to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if pattern.is_empty() {
            return Err(AssetflowError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "pattern is empty".to_string(),
            });
        }
        if pattern.starts_with('!') {
            return Err(AssetflowError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "inline negation is not supported; move it to the exclude list"
                    .to_string(),
            });
        }

        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| AssetflowError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.kind().to_string(),
            })?;
        builder.add(glob);
    }

    builder.build().map_err(|e| AssetflowError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}
