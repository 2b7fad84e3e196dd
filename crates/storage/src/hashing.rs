//! Multi-digest hashing for artifact content
//!
//! sha256 is the primary content address; md5, sha1 and crc64 are kept
//! for integrity checks and legacy clients. All four digests are fed in
//! a single pass so content is never scanned more than once.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use depot_core::{Error, Result};

/// The digests of one artifact's content
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArtifactDigests {
    pub sha256: String,
    pub md5: String,
    pub sha1: String,
    pub crc64: u64,
}

/// Feeds sha256/md5/sha1/crc64 in one pass
pub struct MultiHasher {
    sha256: Sha256,
    md5: Md5,
    sha1: Sha1,
    crc64: crc64fast::Digest,
    bytes: u64,
}

impl MultiHasher {
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: Md5::new(),
            sha1: Sha1::new(),
            crc64: crc64fast::Digest::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.md5.update(data);
        self.sha1.update(data);
        self.crc64.write(data);
        self.bytes += data.len() as u64;
    }

    /// Total bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ArtifactDigests {
        ArtifactDigests {
            sha256: hex::encode(self.sha256.finalize()),
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            crc64: self.crc64.sum64(),
        }
    }
}

impl Default for MultiHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a file by streaming it in 64 KiB chunks
pub async fn digest_file(path: &Path) -> Result<ArtifactDigests> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io(path, "open for hashing", e))?;
    let mut hasher = MultiHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| Error::io(path, "read for hashing", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

/// Digest an in-memory buffer
pub fn digest_bytes(data: &[u8]) -> ArtifactDigests {
    let mut hasher = MultiHasher::new();
    hasher.update(data);
    hasher.finalize()
}
