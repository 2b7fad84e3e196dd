//! Backend driver contract
//!
//! One implementation per storage technology; all of them behind the
//! `FileStorage` trait. Drivers differ only in the mechanics of moving
//! bytes; the chunked block-session extension is shared, operating on
//! the credentials' upload staging directory.

pub mod cos;
pub mod filesystem;
pub mod hdfs;
pub mod s3;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::artifact::ArtifactFile;
use crate::chunked::{self, BlockInfo};
use crate::reader::ArtifactReader;
use depot_config::StorageCredentials;
use depot_core::{Error, Result};

/// The uniform backend contract
///
/// `path` is the sharded directory computed by the locate strategy;
/// `name` is the content hash used as the filename.
#[async_trait::async_trait]
pub trait FileStorage: Send + Sync {
    /// Store an artifact. Idempotent: returns `false` when an object
    /// already existed at the computed path (dedup hit, no bytes moved)
    /// and `true` when new bytes were written. Content addressing makes
    /// a race between two writers of the same hash harmless.
    async fn store(
        &self,
        path: &str,
        name: &str,
        artifact: &ArtifactFile,
        credentials: &StorageCredentials,
    ) -> Result<bool>;

    /// Load an artifact; `Error::NotFound` if absent
    async fn load(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<ArtifactReader>;

    /// Delete an artifact; already-absent objects are not an error
    async fn delete(&self, path: &str, name: &str, credentials: &StorageCredentials)
        -> Result<()>;

    /// Whether an artifact exists
    async fn exist(&self, path: &str, name: &str, credentials: &StorageCredentials)
        -> Result<bool>;

    // Chunked/resumable extension. Numbered chunks are written to the
    // upload staging directory in any order; the final blob is assembled
    // once `list_block_info` confirms the expected set is present.

    async fn store_block(
        &self,
        session: &str,
        sequence: u32,
        hash: &str,
        data: Bytes,
        credentials: &StorageCredentials,
    ) -> Result<()> {
        chunked::store_block(&credentials.upload, session, sequence, hash, data).await
    }

    async fn check_block_path(
        &self,
        session: &str,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        chunked::check_block_path(&credentials.upload, session).await
    }

    async fn delete_block_path(
        &self,
        session: &str,
        credentials: &StorageCredentials,
    ) -> Result<()> {
        chunked::delete_block_path(&credentials.upload, session).await
    }

    async fn list_block_info(
        &self,
        session: &str,
        credentials: &StorageCredentials,
    ) -> Result<Vec<BlockInfo>> {
        chunked::list_block_info(&credentials.upload, session).await
    }

    async fn combine_block(
        &self,
        session: &str,
        credentials: &StorageCredentials,
    ) -> Result<ArtifactFile> {
        chunked::combine_block(&credentials.upload, session).await
    }
}

/// Object key under a bucket: sharded path plus hash filename
pub(crate) fn object_key(path: &str, name: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}

/// Stream a file as a request body without buffering it whole
pub(crate) fn file_stream(
    file: tokio::fs::File,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    futures::stream::try_unfold(file, |mut file| async move {
        let mut buffer = vec![0u8; 64 * 1024];
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            Ok(None)
        } else {
            buffer.truncate(read);
            Ok(Some((Bytes::from(buffer), file)))
        }
    })
}

/// Build a request body from staged artifact content
pub(crate) async fn body_from_artifact(artifact: &ArtifactFile) -> Result<reqwest::Body> {
    if let Some(data) = artifact.bytes() {
        return Ok(reqwest::Body::from(data));
    }
    let path = artifact
        .path()
        .ok_or_else(|| Error::invalid_artifact("artifact has no backing"))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io(path, "open artifact for upload", e))?;
    Ok(reqwest::Body::wrap_stream(file_stream(file)))
}

/// Buffer a response body into an `ArtifactReader`, spilling to the
/// upload staging directory once it crosses the spill threshold.
pub(crate) async fn reader_from_response(
    mut response: reqwest::Response,
    backend: &str,
    credentials: &StorageCredentials,
) -> Result<ArtifactReader> {
    let threshold = credentials.upload.spill_threshold;
    let staging_dir = &credentials.upload.location;

    let mut buffer = BytesMut::new();
    let mut spilled: Option<(tokio::fs::File, tempfile::TempPath)> = None;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::backend(backend, "download", e.to_string()))?
    {
        match &mut spilled {
            Some((file, temp)) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::io(&**temp, "write download spill", e))?;
            }
            None => {
                buffer.extend_from_slice(&chunk);
                if buffer.len() as u64 > threshold {
                    tokio::fs::create_dir_all(staging_dir)
                        .await
                        .map_err(|e| Error::io(staging_dir, "create staging directory", e))?;
                    let temp = tempfile::NamedTempFile::new_in(staging_dir)
                        .map_err(|e| Error::io(staging_dir, "create download spill", e))?
                        .into_temp_path();
                    let mut file = tokio::fs::File::create(&temp)
                        .await
                        .map_err(|e| Error::io(&*temp, "open download spill", e))?;
                    file.write_all(&buffer)
                        .await
                        .map_err(|e| Error::io(&*temp, "write download spill", e))?;
                    buffer.clear();
                    spilled = Some((file, temp));
                }
            }
        }
    }

    match spilled {
        Some((mut file, temp)) => {
            file.flush()
                .await
                .map_err(|e| Error::io(&*temp, "flush download spill", e))?;
            drop(file);
            ArtifactReader::from_temp_path(temp).await
        }
        None => Ok(ArtifactReader::from_bytes(buffer.freeze())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_join_cleanly() {
        assert_eq!(object_key("ab/cd", "abcdef"), "ab/cd/abcdef");
        assert_eq!(object_key("/ab/cd/", "abcdef"), "ab/cd/abcdef");
        assert_eq!(object_key("", "abcdef"), "abcdef");
    }

    #[tokio::test]
    async fn file_stream_yields_whole_content() {
        use futures::TryStreamExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        tokio::fs::write(&path, vec![9u8; 200_000]).await.unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let chunks: Vec<Bytes> = file_stream(file).try_collect().await.unwrap();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 200_000);
    }
}
