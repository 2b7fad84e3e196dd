//! Storage credentials: named backend configurations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::properties::{CacheSettings, UploadSettings};
use depot_core::Error;

/// Backend technology a set of credentials points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Filesystem,
    S3,
    Hdfs,
    ObjectStore,
}

impl BackendKind {
    /// Whether blobs live outside this process's filesystem
    pub fn is_remote(&self) -> bool {
        !matches!(self, BackendKind::Filesystem)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Filesystem => "filesystem",
            BackendKind::S3 => "s3",
            BackendKind::Hdfs => "hdfs",
            BackendKind::ObjectStore => "object_store",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(BackendKind::Filesystem),
            "s3" => Ok(BackendKind::S3),
            "hdfs" => Ok(BackendKind::Hdfs),
            "object_store" => Ok(BackendKind::ObjectStore),
            other => Err(Error::config(format!("unknown backend kind '{other}'"))),
        }
    }
}

/// Connection parameters, one variant per backend technology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local filesystem tree
    Filesystem { root: PathBuf },

    /// S3-compatible object storage, path-style addressing
    S3 {
        endpoint: String,
        region: String,
        bucket: String,
        access_key_id: String,
        secret_access_key: String,
        /// Uploads above this size go through multipart transfer
        #[serde(default = "default_part_size")]
        part_size: u64,
    },

    /// HDFS via the WebHDFS REST gateway
    Hdfs {
        /// Namenode base URLs, tried in order (HA configuration)
        name_nodes: Vec<String>,
        user: String,
        root: String,
    },

    /// Proprietary cloud object store with per-request HMAC-SHA1 signing
    ObjectStore {
        endpoint: String,
        bucket: String,
        secret_id: String,
        secret_key: String,
        /// Validity window for a request signature
        #[serde(default = "default_sign_expiry")]
        sign_expiry: Duration,
    },
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_sign_expiry() -> Duration {
    Duration::from_secs(600)
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Filesystem { .. } => BackendKind::Filesystem,
            BackendConfig::S3 { .. } => BackendKind::S3,
            BackendConfig::Hdfs { .. } => BackendKind::Hdfs,
            BackendConfig::ObjectStore { .. } => BackendKind::ObjectStore,
        }
    }
}

/// A named backend configuration resolvable by key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCredentials {
    /// Lookup key repositories reference these credentials by
    pub key: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub upload: UploadSettings,
}

impl StorageCredentials {
    /// Filesystem credentials rooted at `root`, mostly used in tests
    pub fn filesystem(key: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            backend: BackendConfig::Filesystem { root: root.into() },
            cache: CacheSettings::default(),
            upload: UploadSettings::default(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}
