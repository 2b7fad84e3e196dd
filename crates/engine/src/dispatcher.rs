//! Hash-keyed operation routing
//!
//! The dispatcher is the single entry point for blob operations. Every
//! call resolves its credentials key, computes the sharded path for the
//! content hash, picks the driver registered for the backend kind, and
//! wraps remote drivers in the local cache layer when the credentials
//! ask for it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use depot_cache::CachedStorage;
use depot_config::{BackendKind, CredentialsResolver, PreloadProperties, StorageCredentials};
use depot_core::events::EventEmitter;
use depot_core::{Error, Result};
use depot_storage::{ArtifactFile, ArtifactReader, BlockInfo, FileStorage, ShardedLocate};

pub struct StorageDispatcher {
    drivers: HashMap<BackendKind, Arc<dyn FileStorage>>,
    cached: HashMap<BackendKind, Arc<CachedStorage>>,
    resolver: Arc<CredentialsResolver>,
    locate: ShardedLocate,
    emitter: Arc<EventEmitter>,
    properties: PreloadProperties,
}

impl StorageDispatcher {
    pub fn new(
        resolver: Arc<CredentialsResolver>,
        locate: ShardedLocate,
        emitter: Arc<EventEmitter>,
        properties: PreloadProperties,
    ) -> Self {
        Self {
            drivers: HashMap::new(),
            cached: HashMap::new(),
            resolver,
            locate,
            emitter,
            properties,
        }
    }

    /// Register the driver for a backend kind. Remote kinds also get a
    /// cache wrapper so credentials can opt into local mirroring.
    /// Registration happens once at startup, before the dispatcher is
    /// shared.
    pub fn with_driver(mut self, kind: BackendKind, driver: Arc<dyn FileStorage>) -> Self {
        if kind.is_remote() {
            self.cached.insert(
                kind,
                Arc::new(CachedStorage::new(
                    Arc::clone(&driver),
                    Arc::clone(&self.emitter),
                    self.properties.clone(),
                )),
            );
        }
        self.drivers.insert(kind, driver);
        self
    }

    pub fn resolver(&self) -> &Arc<CredentialsResolver> {
        &self.resolver
    }

    pub fn locate(&self) -> ShardedLocate {
        self.locate
    }

    /// The driver serving these credentials, cache-wrapped when the
    /// credentials enable mirroring on a remote backend
    pub fn driver_for(&self, credentials: &StorageCredentials) -> Result<Arc<dyn FileStorage>> {
        let kind = credentials.kind();
        if credentials.cache.enabled && kind.is_remote() {
            if let Some(cached) = self.cached.get(&kind) {
                return Ok(Arc::clone(cached) as Arc<dyn FileStorage>);
            }
        }
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::config(format!("no driver registered for backend '{kind}'")))
    }

    async fn route(
        &self,
        hash: &str,
        credentials_key: Option<&str>,
    ) -> Result<(Arc<dyn FileStorage>, Arc<StorageCredentials>, String)> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        let path = shard_string(&self.locate, hash)?;
        Ok((driver, credentials, path))
    }

    /// Store a blob under its hash; `false` means it was already there
    pub async fn store(
        &self,
        hash: &str,
        artifact: &ArtifactFile,
        credentials_key: Option<&str>,
    ) -> Result<bool> {
        let (driver, credentials, path) = self.route(hash, credentials_key).await?;
        driver.store(&path, hash, artifact, &credentials).await
    }

    pub async fn load(
        &self,
        hash: &str,
        credentials_key: Option<&str>,
    ) -> Result<ArtifactReader> {
        let (driver, credentials, path) = self.route(hash, credentials_key).await?;
        driver.load(&path, hash, &credentials).await
    }

    pub async fn delete(&self, hash: &str, credentials_key: Option<&str>) -> Result<()> {
        let (driver, credentials, path) = self.route(hash, credentials_key).await?;
        driver.delete(&path, hash, &credentials).await
    }

    pub async fn exist(&self, hash: &str, credentials_key: Option<&str>) -> Result<bool> {
        let (driver, credentials, path) = self.route(hash, credentials_key).await?;
        driver.exist(&path, hash, &credentials).await
    }

    // Chunked block sessions: path-less, they live in the staging
    // directory of whatever credentials the upload runs under.

    pub async fn store_block(
        &self,
        session: &str,
        sequence: u32,
        hash: &str,
        data: Bytes,
        credentials_key: Option<&str>,
    ) -> Result<()> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        driver
            .store_block(session, sequence, hash, data, &credentials)
            .await
    }

    pub async fn check_block_path(
        &self,
        session: &str,
        credentials_key: Option<&str>,
    ) -> Result<bool> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        driver.check_block_path(session, &credentials).await
    }

    pub async fn delete_block_path(
        &self,
        session: &str,
        credentials_key: Option<&str>,
    ) -> Result<()> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        driver.delete_block_path(session, &credentials).await
    }

    pub async fn list_block_info(
        &self,
        session: &str,
        credentials_key: Option<&str>,
    ) -> Result<Vec<BlockInfo>> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        driver.list_block_info(session, &credentials).await
    }

    pub async fn combine_block(
        &self,
        session: &str,
        credentials_key: Option<&str>,
    ) -> Result<ArtifactFile> {
        let credentials = self.resolver.resolve(credentials_key).await?;
        let driver = self.driver_for(&credentials)?;
        driver.combine_block(session, &credentials).await
    }
}

/// Sharded directory as a forward-slash string, the form drivers expect
fn shard_string(locate: &ShardedLocate, hash: &str) -> Result<String> {
    let path = locate.locate(hash)?;
    let parts: Vec<&str> = path
        .iter()
        .map(|c| c.to_str().expect("shard components are hex"))
        .collect();
    Ok(parts.join("/"))
}
