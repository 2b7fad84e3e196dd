//! Mirror tree eviction
//!
//! Two-phase sweep over a credentials' mirror tree: entries past their
//! expiry go first, then the oldest survivors until the tree fits the
//! size budget. Runs out-of-band, never on the read path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use walkdir::WalkDir;

use depot_config::StorageCredentials;
use depot_core::events::{EventEmitter, StorageEvent};
use depot_core::Result;

/// Outcome of one eviction sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionStats {
    pub scanned: u64,
    pub evicted: u64,
    pub reclaimed_bytes: u64,
    pub errors: u64,
}

struct MirrorEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

pub struct CacheEvictor {
    emitter: Arc<EventEmitter>,
}

impl CacheEvictor {
    pub fn new(emitter: Arc<EventEmitter>) -> Self {
        Self { emitter }
    }

    /// Sweep one credentials' mirror tree.
    ///
    /// Per-file problems are counted, not raised; a sweep always runs to
    /// completion over whatever it can reach.
    pub async fn sweep(&self, credentials: &StorageCredentials) -> Result<EvictionStats> {
        let root = &credentials.cache.path;
        let mut stats = EvictionStats::default();
        if !root.exists() {
            return Ok(stats);
        }

        let now = SystemTime::now();
        let mut live: Vec<MirrorEntry> = Vec::new();
        let mut expired: Vec<MirrorEntry> = Vec::new();

        for entry in WalkDir::new(root).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "mirror walk error");
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            stats.scanned += 1;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "stat failed");
                    stats.errors += 1;
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let mirror = MirrorEntry {
                path: entry.path().to_path_buf(),
                modified,
                size: metadata.len(),
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= credentials.cache.expire {
                expired.push(mirror);
            } else {
                live.push(mirror);
            }
        }

        for entry in expired {
            self.remove(root, &credentials.key, entry, &mut stats).await;
        }

        // Size budget, oldest first; 0 means unbounded
        if credentials.cache.max_size > 0 {
            let mut total: u64 = live.iter().map(|e| e.size).sum();
            live.sort_by_key(|e| e.modified);
            let mut victims = live.into_iter();
            while total > credentials.cache.max_size {
                let Some(entry) = victims.next() else { break };
                total -= entry.size;
                self.remove(root, &credentials.key, entry, &mut stats).await;
            }
        }

        tracing::info!(
            credentials = credentials.key,
            scanned = stats.scanned,
            evicted = stats.evicted,
            reclaimed = stats.reclaimed_bytes,
            errors = stats.errors,
            "eviction sweep finished"
        );
        Ok(stats)
    }

    async fn remove(
        &self,
        root: &Path,
        credentials_key: &str,
        entry: MirrorEntry,
        stats: &mut EvictionStats,
    ) {
        if let Err(e) = tokio::fs::remove_file(&entry.path).await {
            tracing::warn!(path = %entry.path.display(), error = %e, "eviction failed");
            stats.errors += 1;
            return;
        }
        stats.evicted += 1;
        stats.reclaimed_bytes += entry.size;

        let relative = entry.path.strip_prefix(root).unwrap_or(&entry.path);
        let filename = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = relative
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.emitter
            .emit(StorageEvent::CacheFileDeleted {
                credentials_key: credentials_key.to_string(),
                path,
                filename,
                size: entry.size,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn credentials(root: &Path, expire: Duration, max_size: u64) -> StorageCredentials {
        let mut creds = StorageCredentials::filesystem("evict-test", root);
        creds.cache.path = root.to_path_buf();
        creds.cache.expire = expire;
        creds.cache.max_size = max_size;
        creds
    }

    async fn write_mirror_file(root: &Path, rel: &str, len: usize) -> PathBuf {
        let path = root.join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, vec![0u8; len]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn fresh_entries_survive_a_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path(), Duration::from_secs(3600), 0);
        let kept = write_mirror_file(dir.path(), "ab/cd/hash1", 10).await;

        let evictor = CacheEvictor::new(Arc::new(EventEmitter::default()));
        let stats = evictor.sweep(&creds).await.unwrap();

        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.evicted, 0);
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn expired_entries_are_removed_with_events() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path(), Duration::ZERO, 0);
        let doomed = write_mirror_file(dir.path(), "ab/cd/hash1", 10).await;

        let emitter = Arc::new(EventEmitter::default());
        let mut stream = emitter.stream();
        let evictor = CacheEvictor::new(emitter);
        let stats = evictor.sweep(&creds).await.unwrap();

        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.reclaimed_bytes, 10);
        assert!(!doomed.exists());
        match stream.try_recv().unwrap() {
            StorageEvent::CacheFileDeleted { path, filename, size, .. } => {
                assert_eq!(path, "ab/cd");
                assert_eq!(filename, "hash1");
                assert_eq!(size, 10);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn size_budget_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path(), Duration::from_secs(3600), 25);
        let oldest = write_mirror_file(dir.path(), "ab/old", 10).await;
        let newest = write_mirror_file(dir.path(), "ab/new", 20).await;

        // Make the age ordering explicit, the files were written within
        // the same instant on fast filesystems.
        let old_mtime = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .append(true)
            .open(&oldest)
            .unwrap()
            .set_modified(old_mtime)
            .unwrap();

        let evictor = CacheEvictor::new(Arc::new(EventEmitter::default()));
        let stats = evictor.sweep(&creds).await.unwrap();

        assert_eq!(stats.evicted, 1);
        assert!(!oldest.exists());
        assert!(newest.exists());
    }

    #[tokio::test]
    async fn sweeping_a_missing_tree_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(&dir.path().join("nowhere"), Duration::ZERO, 0);

        let evictor = CacheEvictor::new(Arc::new(EventEmitter::default()));
        let stats = evictor.sweep(&creds).await.unwrap();
        assert_eq!(stats, EvictionStats::default());
    }
}
