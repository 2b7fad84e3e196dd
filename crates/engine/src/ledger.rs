//! Blob reference ledger
//!
//! Deduplicated blobs are shared by every node that carries their hash,
//! so deleting a node must not delete the blob while other references
//! remain. The ledger counts references per (credentials, hash) pair;
//! blobs whose count reaches zero are left in place for an out-of-band
//! reclamation job running after a grace period.

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;

use depot_core::{Error, Result};

/// Reference counting per blob
#[async_trait::async_trait]
pub trait ReferenceLedger: Send + Sync {
    /// Add one reference, returning the new count
    async fn increment(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64>;

    /// Drop one reference, returning the new count. Decrementing an
    /// unreferenced blob clamps at zero instead of going negative.
    async fn decrement(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64>;

    /// Current reference count
    async fn count(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64>;
}

fn ledger_key(hash: &str, credentials_key: Option<&str>) -> String {
    match credentials_key {
        Some(key) if !key.is_empty() => format!("{key}:{hash}"),
        _ => hash.to_string(),
    }
}

/// JSON-file-backed ledger
///
/// Counts live in memory and every mutation persists the whole map with
/// a write-then-rename, so a crash leaves the previous consistent state
/// rather than a torn file. Installations with heavier churn put a real
/// database behind the trait instead.
pub struct FileReferenceLedger {
    path: PathBuf,
    counts: DashMap<String, u64>,
    // Serializes snapshot-and-rename so two concurrent mutations cannot
    // land their files out of order, leaving the older snapshot on disk.
    persist_lock: tokio::sync::Mutex<()>,
}

impl FileReferenceLedger {
    /// Open a ledger file, loading existing counts when present
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let counts = DashMap::new();
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let loaded: HashMap<String, u64> = serde_json::from_slice(&data)?;
                for (key, count) in loaded {
                    counts.insert(key, count);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&path, "read ledger", e)),
        }
        Ok(Self {
            path,
            counts,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: HashMap<String, u64> = self
            .counts
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let parent = self.path.parent().unwrap_or(std::path::Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, "create ledger directory", e))?;
        let temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io(parent, "create ledger temp file", e))?
            .into_temp_path();
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| Error::io(&*temp, "write ledger", e))?;
        temp.persist(&self.path)
            .map_err(|e| Error::io(&self.path, "rename ledger into place", e.error))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReferenceLedger for FileReferenceLedger {
    async fn increment(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64> {
        let key = ledger_key(hash, credentials_key);
        let count = {
            let mut entry = self.counts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        self.persist().await?;
        Ok(count)
    }

    async fn decrement(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64> {
        let key = ledger_key(hash, credentials_key);
        let count = {
            let mut entry = self.counts.entry(key).or_insert(0);
            if *entry == 0 {
                tracing::warn!(hash, "decrement on an unreferenced blob");
            } else {
                *entry -= 1;
            }
            *entry
        };
        self.persist().await?;
        Ok(count)
    }

    async fn count(&self, hash: &str, credentials_key: Option<&str>) -> Result<u64> {
        let key = ledger_key(hash, credentials_key);
        Ok(self.counts.get(&key).map(|entry| *entry).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn counts_rise_and_fall() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileReferenceLedger::open(dir.path().join("ledger.json"))
            .await
            .unwrap();

        assert_eq!(ledger.increment(HASH, None).await.unwrap(), 1);
        assert_eq!(ledger.increment(HASH, None).await.unwrap(), 2);
        assert_eq!(ledger.decrement(HASH, None).await.unwrap(), 1);
        assert_eq!(ledger.count(HASH, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn decrement_clamps_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileReferenceLedger::open(dir.path().join("ledger.json"))
            .await
            .unwrap();

        assert_eq!(ledger.decrement(HASH, None).await.unwrap(), 0);
        assert_eq!(ledger.count(HASH, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credentials_scope_their_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileReferenceLedger::open(dir.path().join("ledger.json"))
            .await
            .unwrap();

        ledger.increment(HASH, Some("tenant-a")).await.unwrap();
        ledger.increment(HASH, Some("tenant-a")).await.unwrap();
        ledger.increment(HASH, Some("tenant-b")).await.unwrap();

        assert_eq!(ledger.count(HASH, Some("tenant-a")).await.unwrap(), 2);
        assert_eq!(ledger.count(HASH, Some("tenant-b")).await.unwrap(), 1);
        assert_eq!(ledger.count(HASH, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_increments_all_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = std::sync::Arc::new(FileReferenceLedger::open(&path).await.unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ledger = std::sync::Arc::clone(&ledger);
            tasks.spawn(async move { ledger.increment(HASH, None).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let reopened = FileReferenceLedger::open(&path).await.unwrap();
        assert_eq!(reopened.count(HASH, None).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn counts_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        {
            let ledger = FileReferenceLedger::open(&path).await.unwrap();
            ledger.increment(HASH, None).await.unwrap();
            ledger.increment(HASH, None).await.unwrap();
        }

        let reopened = FileReferenceLedger::open(&path).await.unwrap();
        assert_eq!(reopened.count(HASH, None).await.unwrap(), 2);
    }
}
