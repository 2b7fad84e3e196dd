//! Local disk driver
//!
//! Stores blobs under a root directory using the sharded path layout.
//! Writes go through a temp file in the same directory followed by a
//! rename, so readers never observe partial content.

use std::path::{Path, PathBuf};

use super::FileStorage;
use crate::artifact::ArtifactFile;
use crate::reader::ArtifactReader;
use depot_config::{BackendConfig, StorageCredentials};
use depot_core::{Error, Result};

pub struct FilesystemStorage;

impl FilesystemStorage {
    pub fn new() -> Self {
        Self
    }

    fn root(credentials: &StorageCredentials) -> Result<&Path> {
        match &credentials.backend {
            BackendConfig::Filesystem { root } => Ok(root),
            other => Err(Error::config(format!(
                "credentials '{}' carry a {} backend, not filesystem",
                credentials.key,
                other.kind()
            ))),
        }
    }

    fn blob_path(credentials: &StorageCredentials, path: &str, name: &str) -> Result<PathBuf> {
        Ok(Self::root(credentials)?.join(path).join(name))
    }
}

impl Default for FilesystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileStorage for FilesystemStorage {
    async fn store(
        &self,
        path: &str,
        name: &str,
        artifact: &ArtifactFile,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        let target = Self::blob_path(credentials, path, name)?;
        if tokio::fs::metadata(&target).await.is_ok() {
            tracing::debug!(blob = %target.display(), "store skipped, blob exists");
            return Ok(false);
        }

        let parent = target.parent().expect("blob path has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, "create blob directory", e))?;

        // Write-then-rename keeps concurrent readers off partial blobs.
        // Two racing writers of the same hash both rename identical
        // content, so last-write-wins is harmless.
        let temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io(parent, "create blob temp file", e))?;
        let temp_path = temp.into_temp_path();

        let mut reader = artifact.reader().await?;
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::io(&*temp_path, "open blob temp file", e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| Error::io(&*temp_path, "write blob", e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(&*temp_path, "sync blob", e))?;
        drop(file);

        temp_path
            .persist(&target)
            .map_err(|e| Error::io(&target, "rename blob into place", e.error))?;
        tracing::debug!(blob = %target.display(), size = artifact.size(), "blob stored");
        Ok(true)
    }

    async fn load(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<ArtifactReader> {
        let target = Self::blob_path(credentials, path, name)?;
        if tokio::fs::metadata(&target).await.is_err() {
            return Err(Error::not_found(name));
        }
        ArtifactReader::from_path(&target).await
    }

    async fn delete(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<()> {
        let target = Self::blob_path(credentials, path, name)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&target, "delete blob", e)),
        }
    }

    async fn exist(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        let target = Self::blob_path(credentials, path, name)?;
        Ok(tokio::fs::metadata(&target).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(root: &Path) -> StorageCredentials {
        StorageCredentials::filesystem("local", root)
    }

    #[tokio::test]
    async fn store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path());
        let storage = FilesystemStorage::new();
        let artifact = ArtifactFile::from_bytes(&b"hello world"[..], dir.path());

        let written = storage
            .store("ab/cd", "abcdef", &artifact, &creds)
            .await
            .unwrap();
        assert!(written);

        let reader = storage.load("ab/cd", "abcdef", &creds).await.unwrap();
        assert_eq!(reader.read_to_vec().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn storing_the_same_blob_twice_is_a_dedup_hit() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path());
        let storage = FilesystemStorage::new();
        let artifact = ArtifactFile::from_bytes(&b"dup"[..], dir.path());

        assert!(storage.store("ab", "x", &artifact, &creds).await.unwrap());
        assert!(!storage.store("ab", "x", &artifact, &creds).await.unwrap());
    }

    #[tokio::test]
    async fn loading_a_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path());
        let storage = FilesystemStorage::new();

        let err = storage.load("ab", "missing", &creds).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_tolerates_absent_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(dir.path());
        let storage = FilesystemStorage::new();
        let artifact = ArtifactFile::from_bytes(&b"bye"[..], dir.path());

        storage.store("ab", "x", &artifact, &creds).await.unwrap();
        storage.delete("ab", "x", &creds).await.unwrap();
        storage.delete("ab", "x", &creds).await.unwrap();
        assert!(!storage.exist("ab", "x", &creds).await.unwrap());
    }
}
