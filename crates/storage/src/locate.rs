//! Locate strategy: pure mapping from content hash to sharded path
//!
//! Layout, with the default two levels of two hex characters:
//!
//! ```text
//! {root}/
//! ├── ab/
//! │   └── cd/
//! │       └── abcdef0123...   # full hash as filename
//! └── 12/
//!     └── 34/
//!         └── 1234567890...
//! ```
//!
//! The mapping is deterministic and must stay stable for the lifetime of
//! an installation: changing the sharding scheme orphans existing files
//! unless a migration is run.

use std::path::PathBuf;

use depot_core::{Error, Result};

/// Sharded locate strategy
///
/// `depth` directory levels of `width` leading hex characters each bound
/// per-directory fan-out to a constant order of magnitude regardless of
/// how many blobs the installation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardedLocate {
    depth: usize,
    width: usize,
}

impl ShardedLocate {
    pub fn new(depth: usize, width: usize) -> Self {
        Self { depth, width }
    }

    /// Relative directory a hash shards into, e.g. `ab/cd`
    pub fn locate(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < self.depth * self.width || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::invalid_artifact(format!(
                "'{hash}' is not a usable content hash"
            )));
        }
        let mut path = PathBuf::new();
        for level in 0..self.depth {
            let start = level * self.width;
            path.push(&hash[start..start + self.width]);
        }
        Ok(path)
    }

    /// Relative path of the blob itself: sharded directory plus the full
    /// hash as filename
    pub fn full_path(&self, hash: &str) -> Result<PathBuf> {
        Ok(self.locate(hash)?.join(hash))
    }
}

impl Default for ShardedLocate {
    fn default() -> Self {
        Self::new(2, 2)
    }
}
