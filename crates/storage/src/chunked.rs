//! Chunked upload block sessions
//!
//! Clients upload numbered chunks independently, in any order and
//! resumable across client or server restarts, and the server assembles
//! the final blob once the expected set is present. Sessions live under the
//! credentials' upload staging directory and the mechanics are identical
//! for every backend driver.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::artifact::ArtifactFile;
use depot_config::UploadSettings;
use depot_core::{Error, Result};

const BLOCK_EXTENSION: &str = "block";
const HASH_EXTENSION: &str = "sha256";

/// One uploaded chunk as reported by `list_block_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub sequence: u32,
    pub size: u64,
    pub hash: String,
}

fn session_dir(upload: &UploadSettings, session: &str) -> Result<PathBuf> {
    if session.is_empty() || session.contains(['/', '\\', '.']) {
        return Err(Error::invalid_artifact(format!(
            "'{session}' is not a valid block session id"
        )));
    }
    Ok(upload.location.join("blocks").join(session))
}

fn block_path(dir: &Path, sequence: u32) -> PathBuf {
    dir.join(format!("{sequence}.{BLOCK_EXTENSION}"))
}

fn hash_path(dir: &Path, sequence: u32) -> PathBuf {
    dir.join(format!("{sequence}.{HASH_EXTENSION}"))
}

/// Write one numbered chunk and its hash sidecar
pub async fn store_block(
    upload: &UploadSettings,
    session: &str,
    sequence: u32,
    hash: &str,
    data: Bytes,
) -> Result<()> {
    let dir = session_dir(upload, session)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::io(&dir, "create block session", e))?;

    let path = block_path(&dir, sequence);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| Error::io(&path, "create block", e))?;
    file.write_all(&data)
        .await
        .map_err(|e| Error::io(&path, "write block", e))?;
    file.flush()
        .await
        .map_err(|e| Error::io(&path, "flush block", e))?;

    let sidecar = hash_path(&dir, sequence);
    tokio::fs::write(&sidecar, hash)
        .await
        .map_err(|e| Error::io(&sidecar, "write block hash", e))?;
    Ok(())
}

/// Whether the session directory exists
pub async fn check_block_path(upload: &UploadSettings, session: &str) -> Result<bool> {
    let dir = session_dir(upload, session)?;
    Ok(tokio::fs::metadata(&dir).await.is_ok())
}

/// Remove a session and everything in it; absent sessions are fine
pub async fn delete_block_path(upload: &UploadSettings, session: &str) -> Result<()> {
    let dir = session_dir(upload, session)?;
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&dir, "delete block session", e)),
    }
}

/// List uploaded chunks ordered by sequence
pub async fn list_block_info(upload: &UploadSettings, session: &str) -> Result<Vec<BlockInfo>> {
    let dir = session_dir(upload, session)?;
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(&dir, "list block session", e)),
    };

    let mut blocks = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io(&dir, "list block session", e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
            continue;
        }
        let Some(sequence) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let size = entry
            .metadata()
            .await
            .map_err(|e| Error::io(&path, "stat block", e))?
            .len();
        let hash = tokio::fs::read_to_string(hash_path(&dir, sequence))
            .await
            .unwrap_or_default();
        blocks.push(BlockInfo {
            sequence,
            size,
            hash,
        });
    }

    blocks.sort_by_key(|b| b.sequence);
    Ok(blocks)
}

/// Concatenate the session's chunks in sequence order into one staged
/// artifact and remove the session.
///
/// Only ever invoked after `list_block_info`/`check_block_path` confirm
/// the expected set is present; one logical uploader owns a session.
pub async fn combine_block(upload: &UploadSettings, session: &str) -> Result<ArtifactFile> {
    let blocks = list_block_info(upload, session).await?;
    if blocks.is_empty() {
        return Err(Error::not_found(format!("block session '{session}'")));
    }

    let dir = session_dir(upload, session)?;
    let mut temp = tempfile::NamedTempFile::new_in(&upload.location)
        .map_err(|e| Error::io(&upload.location, "create combine target", e))?;
    let mut total = 0u64;
    for block in &blocks {
        let path = block_path(&dir, block.sequence);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::io(&path, "read block", e))?;
        std::io::Write::write_all(&mut temp, &data)
            .map_err(|e| Error::io(temp.path(), "append block", e))?;
        total += data.len() as u64;
    }
    std::io::Write::flush(&mut temp).map_err(|e| Error::io(temp.path(), "flush combine target", e))?;

    delete_block_path(upload, session).await?;
    Ok(ArtifactFile::from_temp(temp, total, &upload.location))
}
