//! Read-through / write-through cache wrapper

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use depot_config::{PreloadProperties, StorageCredentials};
use depot_core::events::{EventEmitter, StorageEvent};
use depot_core::{Error, Result};
use depot_storage::{ArtifactFile, ArtifactReader, FileStorage};

/// A remote driver fronted by a local mirror tree
///
/// The remote stays authoritative: stores and deletes go there first,
/// existence checks never consult the mirror. Only reads are served
/// locally, and only while the mirror entry is within its expiry.
pub struct CachedStorage {
    remote: Arc<dyn FileStorage>,
    emitter: Arc<EventEmitter>,
    properties: PreloadProperties,
    /// Last access-time refresh per mirror file, for rate limiting
    last_refresh: DashMap<PathBuf, Instant>,
}

impl CachedStorage {
    pub fn new(
        remote: Arc<dyn FileStorage>,
        emitter: Arc<EventEmitter>,
        properties: PreloadProperties,
    ) -> Self {
        Self {
            remote,
            emitter,
            properties,
            last_refresh: DashMap::new(),
        }
    }

    fn mirror_path(credentials: &StorageCredentials, path: &str, name: &str) -> PathBuf {
        credentials.cache.path.join(path).join(name)
    }

    /// Whether a mirror file exists and is within its expiry; returns
    /// its size when it does.
    async fn fresh_mirror(mirror: &Path, credentials: &StorageCredentials) -> Option<u64> {
        let metadata = tokio::fs::metadata(mirror).await.ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())?;
        (age < credentials.cache.expire).then(|| metadata.len())
    }

    /// Access bookkeeping for a cache hit. Small entries and rapid
    /// repeats stay silent so metadata writes do not dominate reads.
    async fn record_hit(
        &self,
        mirror: &Path,
        credentials: &StorageCredentials,
        path: &str,
        name: &str,
        size: u64,
    ) {
        if self.properties.only_record_cache_miss || size < self.properties.min_size {
            return;
        }
        if let Some(last) = self.last_refresh.get(mirror) {
            if last.elapsed() < self.properties.min_access_interval {
                return;
            }
        }
        self.last_refresh.insert(mirror.to_path_buf(), Instant::now());

        // Refresh the mtime so the evictor sees this entry as live
        let touch = std::fs::File::options()
            .append(true)
            .open(mirror)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touch {
            tracing::warn!(mirror = %mirror.display(), error = %e, "mtime refresh failed");
        }

        self.emitter
            .emit(StorageEvent::CacheFileAccessed {
                credentials_key: credentials.key.clone(),
                path: path.to_string(),
                filename: name.to_string(),
                size,
            })
            .await;
    }

    /// Populate the mirror from a remote reader, write-then-rename
    async fn fill_mirror(mirror: &Path, mut reader: ArtifactReader) -> Result<u64> {
        let parent = mirror.parent().expect("mirror path has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, "create mirror directory", e))?;
        let temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io(parent, "create mirror temp file", e))?
            .into_temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| Error::io(&*temp, "open mirror temp file", e))?;
        let copied = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| Error::io(&*temp, "write mirror file", e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(&*temp, "sync mirror file", e))?;
        drop(file);
        temp.persist(mirror)
            .map_err(|e| Error::io(mirror, "rename mirror into place", e.error))?;
        Ok(copied)
    }
}

#[async_trait::async_trait]
impl FileStorage for CachedStorage {
    async fn store(
        &self,
        path: &str,
        name: &str,
        artifact: &ArtifactFile,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        // The remote is authoritative; its answer is the caller's answer
        let newly_written = self.remote.store(path, name, artifact, credentials).await?;

        // Mirror population is an optimization, failures only get logged
        if newly_written {
            let mirror = Self::mirror_path(credentials, path, name);
            match artifact.reader().await {
                Ok(reader) => {
                    if let Err(e) = Self::fill_mirror(&mirror, reader).await {
                        tracing::warn!(name, error = %e, "mirror write-through failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(name, error = %e, "mirror write-through failed");
                }
            }
        }
        Ok(newly_written)
    }

    async fn load(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<ArtifactReader> {
        let mirror = Self::mirror_path(credentials, path, name);

        if let Some(size) = Self::fresh_mirror(&mirror, credentials).await {
            tracing::debug!(name, "cache hit");
            self.record_hit(&mirror, credentials, path, name, size).await;
            return ArtifactReader::from_path(&mirror).await;
        }

        tracing::debug!(name, "cache miss, filling from remote");
        let remote_reader = self.remote.load(path, name, credentials).await?;
        let size = Self::fill_mirror(&mirror, remote_reader).await?;
        self.last_refresh.insert(mirror.clone(), Instant::now());

        self.emitter
            .emit(StorageEvent::CacheFileLoaded {
                credentials_key: credentials.key.clone(),
                path: path.to_string(),
                filename: name.to_string(),
                size,
            })
            .await;

        ArtifactReader::from_path(&mirror).await
    }

    async fn delete(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<()> {
        self.remote.delete(path, name, credentials).await?;

        let mirror = Self::mirror_path(credentials, path, name);
        self.last_refresh.remove(&mirror);
        match tokio::fs::remove_file(&mirror).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&mirror, "delete mirror file", e)),
        }
    }

    async fn exist(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        // The mirror can lag deletes, only the remote knows the truth
        self.remote.exist(path, name, credentials).await
    }
}
