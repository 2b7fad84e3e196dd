//! Upload-side staging: `ArtifactFile`
//!
//! Received content stays in memory until it crosses a size threshold,
//! then spills to a temp file in the upload staging directory. Digests
//! are computed once on first request and memoized, so repeated hash
//! requests never re-scan the content.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::hashing::{self, ArtifactDigests, MultiHasher};
use crate::reader::ArtifactReader;
use depot_core::{Error, Result};

enum Backing {
    Memory(Bytes),
    /// Spilled to a staging file owned by this artifact; removed on drop
    Temp(NamedTempFile),
    /// Caller-owned file, not removed on drop
    Path(PathBuf),
}

/// Staged upload content, memory-resident or flushed to a staging file
pub struct ArtifactFile {
    backing: Backing,
    size: u64,
    staging_dir: PathBuf,
    digests: OnceCell<ArtifactDigests>,
}

impl ArtifactFile {
    /// Stage content from a reader, spilling to `staging_dir` once more
    /// than `threshold` bytes have arrived.
    pub async fn receive(
        mut reader: impl AsyncRead + Unpin + Send,
        threshold: u64,
        staging_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let staging_dir = staging_dir.into();
        let mut buffer: Vec<u8> = Vec::new();
        let mut spilled: Option<NamedTempFile> = None;
        let mut hasher = MultiHasher::new();
        let mut chunk = vec![0u8; 64 * 1024];

        loop {
            let read = reader
                .read(&mut chunk)
                .await
                .map_err(|e| Error::io(&staging_dir, "receive upload", e))?;
            if read == 0 {
                break;
            }
            let data = &chunk[..read];
            hasher.update(data);

            match &mut spilled {
                Some(temp) => temp
                    .write_all(data)
                    .map_err(|e| Error::io(temp.path(), "write staging file", e))?,
                None => {
                    buffer.extend_from_slice(data);
                    if buffer.len() as u64 > threshold {
                        let mut temp = create_staging_file(&staging_dir)?;
                        temp.write_all(&buffer)
                            .map_err(|e| Error::io(temp.path(), "write staging file", e))?;
                        buffer.clear();
                        spilled = Some(temp);
                    }
                }
            }
        }

        let size = hasher.bytes_hashed();
        let digests = hasher.finalize();
        let artifact = match spilled {
            Some(mut temp) => {
                temp.flush()
                    .map_err(|e| Error::io(temp.path(), "flush staging file", e))?;
                Self {
                    backing: Backing::Temp(temp),
                    size,
                    staging_dir,
                    digests: OnceCell::new(),
                }
            }
            None => Self {
                backing: Backing::Memory(Bytes::from(buffer)),
                size,
                staging_dir,
                digests: OnceCell::new(),
            },
        };
        // Digests came for free while receiving
        let _ = artifact.digests.set(digests);
        Ok(artifact)
    }

    /// Stage an in-memory payload
    pub fn from_bytes(data: impl Into<Bytes>, staging_dir: impl Into<PathBuf>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            backing: Backing::Memory(data),
            staging_dir: staging_dir.into(),
            digests: OnceCell::new(),
        }
    }

    /// Wrap an existing file without taking ownership of it
    pub async fn from_path(path: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io(&path, "stat artifact", e))?
            .len();
        Ok(Self {
            backing: Backing::Path(path),
            size,
            staging_dir: staging_dir.into(),
            digests: OnceCell::new(),
        })
    }

    /// Wrap an already-written staging file, taking ownership
    pub fn from_temp(temp: NamedTempFile, size: u64, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::Temp(temp),
            size,
            staging_dir: staging_dir.into(),
            digests: OnceCell::new(),
        }
    }

    /// Content size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the content is still memory-resident
    pub fn is_in_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// The memory-resident payload, if any
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.backing {
            Backing::Memory(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// The on-disk path, if the content has been flushed
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::Temp(temp) => Some(temp.path()),
            Backing::Path(path) => Some(path),
        }
    }

    /// Force the content onto disk. Idempotent; returns the file path.
    pub fn flush_to_file(&mut self) -> Result<&Path> {
        if let Backing::Memory(data) = &self.backing {
            let mut temp = create_staging_file(&self.staging_dir)?;
            temp.write_all(data)
                .map_err(|e| Error::io(temp.path(), "write staging file", e))?;
            temp.flush()
                .map_err(|e| Error::io(temp.path(), "flush staging file", e))?;
            self.backing = Backing::Temp(temp);
        }
        Ok(self.path().expect("flushed backing has a path"))
    }

    /// Open a reader over the staged content
    pub async fn reader(&self) -> Result<ArtifactReader> {
        match &self.backing {
            Backing::Memory(data) => Ok(ArtifactReader::from_bytes(data.clone())),
            Backing::Temp(temp) => ArtifactReader::from_path(temp.path()).await,
            Backing::Path(path) => ArtifactReader::from_path(path).await,
        }
    }

    /// All four digests, computed once and memoized
    pub async fn digests(&self) -> Result<&ArtifactDigests> {
        if let Some(digests) = self.digests.get() {
            return Ok(digests);
        }
        let computed = match &self.backing {
            Backing::Memory(data) => hashing::digest_bytes(data),
            Backing::Temp(temp) => hashing::digest_file(temp.path()).await?,
            Backing::Path(path) => hashing::digest_file(path).await?,
        };
        Ok(self.digests.get_or_init(|| computed))
    }

    pub async fn sha256(&self) -> Result<String> {
        Ok(self.digests().await?.sha256.clone())
    }

    pub async fn md5(&self) -> Result<String> {
        Ok(self.digests().await?.md5.clone())
    }

    pub async fn sha1(&self) -> Result<String> {
        Ok(self.digests().await?.sha1.clone())
    }

    pub async fn crc64(&self) -> Result<u64> {
        Ok(self.digests().await?.crc64)
    }
}

impl std::fmt::Debug for ArtifactFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &self.backing {
            Backing::Memory(_) => "memory",
            Backing::Temp(_) => "temp",
            Backing::Path(_) => "path",
        };
        f.debug_struct("ArtifactFile")
            .field("backing", &backing)
            .field("size", &self.size)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

fn create_staging_file(staging_dir: &Path) -> Result<NamedTempFile> {
    std::fs::create_dir_all(staging_dir)
        .map_err(|e| Error::io(staging_dir, "create staging directory", e))?;
    NamedTempFile::new_in(staging_dir)
        .map_err(|e| Error::io(staging_dir, "create staging file", e))
}
