//! Range-addressable block transfer
//!
//! `BlockChannel` hands callers arbitrary contiguous block ranges of a
//! hash-identified artifact, the transport primitive a delta-transfer
//! protocol rides on. The diff/signature computation itself lives
//! elsewhere; this only serves requested ranges.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::artifact::ArtifactFile;
use depot_core::{Error, Result};

/// Range-addressable transfer over an artifact's content
///
/// Blocks are numbered from zero; the byte range of `(start_seq,
/// end_seq, block_size)` is `[start_seq * block_size, (end_seq + 1) *
/// block_size)`, clamped to the content size.
#[async_trait::async_trait]
pub trait BlockChannel: Send {
    /// Copy the requested block range into `target`, returning the
    /// number of bytes written.
    async fn transfer_to(
        &mut self,
        start_seq: u64,
        end_seq: u64,
        block_size: u64,
        target: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    /// Total content size in bytes
    fn total_size(&self) -> u64;

    /// The content name (hash) this channel serves
    fn name(&self) -> &str;

    /// Release any underlying resources
    async fn close(&mut self) -> Result<()>;
}

fn byte_range(start_seq: u64, end_seq: u64, block_size: u64, total: u64) -> Result<(u64, u64)> {
    if start_seq > end_seq {
        return Err(Error::invalid_artifact(format!(
            "block range {start_seq}..={end_seq} is inverted"
        )));
    }
    if block_size == 0 {
        return Err(Error::invalid_artifact("block size must be non-zero"));
    }
    // Sequence numbers are client-supplied; saturate rather than
    // overflow before clamping to the content size.
    let start = start_seq.saturating_mul(block_size).min(total);
    let end = end_seq
        .saturating_add(1)
        .saturating_mul(block_size)
        .min(total);
    Ok((start, end))
}

/// Block channel over content already buffered in memory
pub struct MemoryBlockChannel {
    name: String,
    data: Bytes,
}

impl MemoryBlockChannel {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait::async_trait]
impl BlockChannel for MemoryBlockChannel {
    async fn transfer_to(
        &mut self,
        start_seq: u64,
        end_seq: u64,
        block_size: u64,
        target: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let (start, end) = byte_range(start_seq, end_seq, block_size, self.total_size())?;
        let slice = &self.data[start as usize..end as usize];
        target
            .write_all(slice)
            .await
            .map_err(|e| Error::io(PathBuf::new(), "write block range", e))?;
        Ok(slice.len() as u64)
    }

    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Block channel over content streamed to a file
pub struct FileBlockChannel {
    name: String,
    path: PathBuf,
    size: u64,
}

impl FileBlockChannel {
    pub async fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io(&path, "stat block file", e))?
            .len();
        Ok(Self {
            name: name.into(),
            path,
            size,
        })
    }
}

#[async_trait::async_trait]
impl BlockChannel for FileBlockChannel {
    async fn transfer_to(
        &mut self,
        start_seq: u64,
        end_seq: u64,
        block_size: u64,
        target: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let (start, end) = byte_range(start_seq, end_seq, block_size, self.size)?;
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, "open block file", e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| Error::io(&self.path, "seek block file", e))?;

        let mut remaining = end - start;
        let mut buffer = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let read = file
                .read(&mut buffer[..want])
                .await
                .map_err(|e| Error::io(&self.path, "read block range", e))?;
            if read == 0 {
                break;
            }
            target
                .write_all(&buffer[..read])
                .await
                .map_err(|e| Error::io(&self.path, "write block range", e))?;
            remaining -= read as u64;
            written += read as u64;
        }
        Ok(written)
    }

    fn total_size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

enum LazyBacking {
    Uninitialized,
    Memory(Bytes),
    Disk(PathBuf),
}

/// Block channel that defers choosing its backing until first use
///
/// The backing branches on whether the associated upload stayed in
/// memory or was already flushed to disk, so small artifacts avoid disk
/// I/O while large ones avoid unbounded memory growth.
pub struct LazyBlockChannel {
    name: String,
    artifact: Arc<ArtifactFile>,
    backing: LazyBacking,
}

impl LazyBlockChannel {
    pub fn new(name: impl Into<String>, artifact: Arc<ArtifactFile>) -> Self {
        Self {
            name: name.into(),
            artifact,
            backing: LazyBacking::Uninitialized,
        }
    }

    /// The single transition out of `Uninitialized`
    fn materialize(&mut self) -> Result<()> {
        if matches!(self.backing, LazyBacking::Uninitialized) {
            self.backing = match (self.artifact.bytes(), self.artifact.path()) {
                (Some(data), _) => LazyBacking::Memory(data),
                (None, Some(path)) => LazyBacking::Disk(path.to_path_buf()),
                (None, None) => {
                    return Err(Error::invalid_artifact("artifact has no backing"));
                }
            };
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockChannel for LazyBlockChannel {
    async fn transfer_to(
        &mut self,
        start_seq: u64,
        end_seq: u64,
        block_size: u64,
        target: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.materialize()?;
        match &self.backing {
            LazyBacking::Memory(data) => {
                let mut inner = MemoryBlockChannel::new(self.name.clone(), data.clone());
                inner.transfer_to(start_seq, end_seq, block_size, target).await
            }
            LazyBacking::Disk(path) => {
                let mut inner = FileBlockChannel::open(self.name.clone(), path).await?;
                inner.transfer_to(start_seq, end_seq, block_size, target).await
            }
            LazyBacking::Uninitialized => unreachable!("materialize ran above"),
        }
    }

    fn total_size(&self) -> u64 {
        self.artifact.size()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        self.backing = LazyBacking::Uninitialized;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_channel_serves_middle_range() {
        let mut channel = MemoryBlockChannel::new("h", Bytes::from_static(b"0123456789"));
        let mut out = Vec::new();

        let written = channel.transfer_to(1, 2, 3, &mut out).await.unwrap();

        assert_eq!(written, 6);
        assert_eq!(out, b"345678");
    }

    #[tokio::test]
    async fn ranges_clamp_to_total_size() {
        let mut channel = MemoryBlockChannel::new("h", Bytes::from_static(b"0123456789"));
        let mut out = Vec::new();

        let written = channel.transfer_to(3, 9, 3, &mut out).await.unwrap();

        assert_eq!(written, 1);
        assert_eq!(out, b"9");
    }

    #[tokio::test]
    async fn huge_sequence_numbers_clamp_instead_of_overflowing() {
        let mut channel = MemoryBlockChannel::new("h", Bytes::from_static(b"0123456789"));
        let mut out = Vec::new();

        let written = channel.transfer_to(0, u64::MAX, 2, &mut out).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(out, b"0123456789");

        out.clear();
        let written = channel
            .transfer_to(u64::MAX, u64::MAX, u64::MAX, &mut out)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let mut channel = MemoryBlockChannel::new("h", Bytes::from_static(b"0123456789"));
        let mut out = Vec::new();

        assert!(channel.transfer_to(2, 1, 3, &mut out).await.is_err());
        assert!(channel.transfer_to(0, 0, 0, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn file_channel_matches_memory_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut file_channel = FileBlockChannel::open("h", &path).await.unwrap();
        let mut memory_channel = MemoryBlockChannel::new("h", Bytes::from_static(b"0123456789"));

        let mut from_file = Vec::new();
        let mut from_memory = Vec::new();
        file_channel.transfer_to(0, 1, 4, &mut from_file).await.unwrap();
        memory_channel.transfer_to(0, 1, 4, &mut from_memory).await.unwrap();

        assert_eq!(from_file, from_memory);
        assert_eq!(from_file, b"01234567");
    }

    #[tokio::test]
    async fn lazy_channel_uses_memory_backing_for_buffered_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Arc::new(ArtifactFile::from_bytes(&b"0123456789"[..], dir.path()));
        let mut channel = LazyBlockChannel::new("h", artifact);

        let mut out = Vec::new();
        let written = channel.transfer_to(0, 0, 4, &mut out).await.unwrap();

        assert_eq!(written, 4);
        assert_eq!(out, b"0123");
    }

    #[tokio::test]
    async fn lazy_channel_uses_disk_backing_for_spilled_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"0123456789".repeat(100);
        let artifact = Arc::new(
            ArtifactFile::receive(&payload[..], 16, dir.path())
                .await
                .unwrap(),
        );
        assert!(!artifact.is_in_memory());

        let mut channel = LazyBlockChannel::new("h", artifact);
        let mut out = Vec::new();
        channel.transfer_to(0, 0, 10, &mut out).await.unwrap();

        assert_eq!(out, b"0123456789");
    }
}
