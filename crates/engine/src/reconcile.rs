//! Reconciliation walker
//!
//! Converges a local sharded blob tree onto its backend: every blob
//! present locally but missing remotely is uploaded, blobs the backend
//! already holds are left alone. Used after restoring a node from
//! backup or when a backend migration left the two sides apart. The
//! tree's filenames are trusted as content hashes; files that are not
//! hash-named are counted as errors and skipped.

use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::dispatcher::StorageDispatcher;
use depot_core::Result;
use depot_storage::ArtifactFile;

/// Outcome of one reconciliation run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Blob files visited
    pub total: u64,
    /// Uploaded because the backend was missing them
    pub synchronized: u64,
    /// Already present on the backend
    pub ignored: u64,
    /// Files skipped or failed
    pub errors: u64,
    /// Bytes across all visited blob files
    pub total_size: u64,
}

pub struct ReconcileWalker {
    dispatcher: Arc<StorageDispatcher>,
}

impl ReconcileWalker {
    pub fn new(dispatcher: Arc<StorageDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Walk `root` and push missing blobs to the backend behind
    /// `credentials_key`.
    ///
    /// One file failing never stops the walk; the run always covers
    /// whatever it can reach.
    pub async fn reconcile(
        &self,
        root: &Path,
        credentials_key: Option<&str>,
    ) -> Result<ReconcileStats> {
        let credentials = self.dispatcher.resolver().resolve(credentials_key).await?;
        let staging = credentials.upload.location.clone();
        let mut stats = ReconcileStats::default();

        for entry in WalkDir::new(root).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "reconcile walk error");
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            // In-flight uploads and mirrors are not blobs
            if entry.path().starts_with(&staging)
                || entry.path().starts_with(&credentials.cache.path)
            {
                continue;
            }

            let Some(hash) = entry.path().file_name().and_then(|n| n.to_str()) else {
                stats.errors += 1;
                continue;
            };
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                tracing::warn!(file = %entry.path().display(), "not a hash-named blob, skipping");
                stats.errors += 1;
                continue;
            }

            stats.total += 1;
            if let Err(e) = self
                .reconcile_one(entry.path(), hash, &staging, credentials_key, &mut stats)
                .await
            {
                tracing::warn!(hash, error = %e, "reconcile failed for blob");
                stats.errors += 1;
            }
        }

        tracing::info!(
            root = %root.display(),
            total = stats.total,
            synchronized = stats.synchronized,
            ignored = stats.ignored,
            errors = stats.errors,
            total_size = stats.total_size,
            "reconcile run finished"
        );
        Ok(stats)
    }

    async fn reconcile_one(
        &self,
        path: &Path,
        hash: &str,
        staging: &Path,
        credentials_key: Option<&str>,
        stats: &mut ReconcileStats,
    ) -> Result<()> {
        let artifact = ArtifactFile::from_path(path, staging).await?;
        stats.total_size += artifact.size();

        if self.dispatcher.exist(hash, credentials_key).await? {
            stats.ignored += 1;
            return Ok(());
        }
        self.dispatcher.store(hash, &artifact, credentials_key).await?;
        stats.synchronized += 1;
        Ok(())
    }
}
