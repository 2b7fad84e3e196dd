//! Readers for artifact content
//!
//! Remote drivers buffer small payloads in memory and spill large ones
//! to a staging file; either way callers get one `ArtifactReader`.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use depot_core::{Error, Result};

enum ReaderInner {
    File(BufReader<File>),
    Memory { data: Bytes, position: usize },
}

/// Reader over loaded artifact content, file- or memory-backed
pub struct ArtifactReader {
    inner: ReaderInner,
    size: u64,
    // Keeps a spill file alive (and deleted afterwards) for the
    // lifetime of the reader.
    _temp: Option<TempPath>,
}

impl ArtifactReader {
    /// Reader over an in-memory payload
    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self {
            inner: ReaderInner::Memory { data, position: 0 },
            size,
            _temp: None,
        }
    }

    /// Reader over an existing file
    pub async fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::io(path, "open artifact", e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::io(path, "stat artifact", e))?
            .len();
        Ok(Self {
            inner: ReaderInner::File(BufReader::new(file)),
            size,
            _temp: None,
        })
    }

    /// Reader over a spill file that should be deleted once the reader
    /// is dropped
    pub async fn from_temp_path(temp: TempPath) -> Result<Self> {
        let path: PathBuf = temp.to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|e| Error::io(&path, "open spill file", e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::io(&path, "stat spill file", e))?
            .len();
        Ok(Self {
            inner: ReaderInner::File(BufReader::new(file)),
            size,
            _temp: Some(temp),
        })
    }

    /// Content size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the reader into a buffer
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        self.read_to_end(&mut out)
            .await
            .map_err(|e| Error::io(PathBuf::new(), "drain artifact reader", e))?;
        Ok(out)
    }
}

impl std::fmt::Debug for ArtifactReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &self.inner {
            ReaderInner::File(_) => "file",
            ReaderInner::Memory { .. } => "memory",
        };
        f.debug_struct("ArtifactReader")
            .field("backing", &backing)
            .field("size", &self.size)
            .finish()
    }
}

impl AsyncRead for ArtifactReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            ReaderInner::File(reader) => Pin::new(reader).poll_read(cx, buf),
            ReaderInner::Memory { data, position } => {
                let remaining = data.len() - *position;
                if remaining > 0 {
                    let to_read = remaining.min(buf.remaining());
                    buf.put_slice(&data[*position..*position + to_read]);
                    *position += to_read;
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_reader_round_trips() {
        let reader = ArtifactReader::from_bytes(Bytes::from_static(b"hello world"));
        assert_eq!(reader.size(), 11);
        assert_eq!(reader.read_to_vec().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn file_reader_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"file content").await.unwrap();

        let reader = ArtifactReader::from_path(&path).await.unwrap();
        assert_eq!(reader.size(), 12);
        assert_eq!(reader.read_to_vec().await.unwrap(), b"file content");
    }

    #[test]
    fn debug_names_the_backing() {
        let reader = ArtifactReader::from_bytes(Bytes::from_static(b"abc"));
        let rendered = format!("{reader:?}");
        assert!(rendered.contains("memory"));
        assert!(rendered.contains("size: 3"));
    }

    #[tokio::test]
    async fn temp_reader_removes_file_on_drop() {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"spill").unwrap();
        let temp_path = temp.into_temp_path();
        let path = temp_path.to_path_buf();

        let reader = ArtifactReader::from_temp_path(temp_path).await.unwrap();
        assert_eq!(reader.read_to_vec().await.unwrap(), b"spill");
        assert!(!path.exists());
    }
}
