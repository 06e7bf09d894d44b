//! Per-stage memo of processed files
//!
//! Entries are keyed by path and remember the fingerprint of the file as it
//! was when processed. A lookup only hits while the file still has that
//! fingerprint; anything else drops the entry and reports a miss.
//!
//! The cache lives in memory for as long as its owning transform stage, so
//! repeated runs in watch mode skip unchanged inputs. Nothing is persisted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How file state is condensed into a fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintStrategy {
    /// Modification time plus size (cheap, no file read)
    #[default]
    MtimeSize,
    /// BLAKE3 digest of the file contents
    Content,
}

/// Identity of a file's state at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    MtimeSize { modified: SystemTime, len: u64 },
    Content(blake3::Hash),
}

impl FingerprintStrategy {
    /// Fingerprint the file at `path` as it is now
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        match self {
            Self::MtimeSize => {
                let meta = std::fs::metadata(path)?;
                Ok(Fingerprint::MtimeSize {
                    modified: meta.modified()?,
                    len: meta.len(),
                })
            }
            Self::Content => {
                let file = std::fs::File::open(path)?;
                let hash = Hasher::new().update_reader(file)?.finalize();
                Ok(Fingerprint::Content(hash))
            }
        }
    }
}

/// What a stage produced for a file the last time it processed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedOutcome {
    /// The stage wrote these files
    Outputs(Vec<PathBuf>),
    /// The stage checked the file and had nothing to report
    Clean,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Hit(V),
    /// Carries the current fingerprint so the caller can `put` without
    /// recomputing it
    Miss(Fingerprint),
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    fingerprint: Fingerprint,
    value: V,
}

/// In-memory, unbounded memo keyed by file path
#[derive(Debug, Clone)]
pub struct Cache<V = CachedOutcome> {
    strategy: FingerprintStrategy,
    entries: HashMap<PathBuf, CacheEntry<V>>,
    hits: usize,
    misses: usize,
}

impl<V: Clone> Cache<V> {
    /// Create an empty cache
    pub fn new(strategy: FingerprintStrategy) -> Self {
        Self {
            strategy,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn strategy(&self) -> FingerprintStrategy {
        self.strategy
    }

    /// Look up `path`, validating the stored fingerprint against the file
    pub fn get(&mut self, path: &Path) -> Result<Lookup<V>> {
        let current = self.strategy.fingerprint(path)?;

        match self.entries.get(path) {
            Some(entry) if entry.fingerprint == current => {
                self.hits += 1;
                Ok(Lookup::Hit(entry.value.clone()))
            }
            Some(_) => {
                tracing::trace!(path = %path.display(), "fingerprint changed; dropping entry");
                self.entries.remove(path);
                self.misses += 1;
                Ok(Lookup::Miss(current))
            }
            None => {
                self.misses += 1;
                Ok(Lookup::Miss(current))
            }
        }
    }

    /// Record the result of processing `path` in the state `fingerprint`
    pub fn put(&mut self, path: &Path, fingerprint: Fingerprint, value: V) {
        self.entries
            .insert(path.to_path_buf(), CacheEntry { fingerprint, value });
    }

    /// Forget `path`
    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entries, {} hits, {} misses",
            self.entries, self.hits, self.misses
        )
    }
}
