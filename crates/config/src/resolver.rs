//! Credentials lookup with a bounded short-TTL cache
//!
//! Every storage call starts with a credentials key. Resolution hits a
//! configuration service, so results are cached briefly (bounded TTL,
//! bounded entry count). An absent or unconfigured key falls back to the
//! process-wide default credentials.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::credentials::StorageCredentials;
use depot_core::Result;

/// Source of credentials by key, typically backed by a config service
#[async_trait::async_trait]
pub trait CredentialsSource: Send + Sync {
    /// Look up credentials by key. `Ok(None)` means the key is unknown.
    async fn find_by_key(&self, key: &str) -> Result<Option<StorageCredentials>>;
}

/// A static in-memory source, used in tests and single-tenant setups
pub struct StaticCredentialsSource {
    entries: Vec<StorageCredentials>,
}

impl StaticCredentialsSource {
    pub fn new(entries: Vec<StorageCredentials>) -> Self {
        Self { entries }
    }
}

#[async_trait::async_trait]
impl CredentialsSource for StaticCredentialsSource {
    async fn find_by_key(&self, key: &str) -> Result<Option<StorageCredentials>> {
        Ok(self.entries.iter().find(|c| c.key == key).cloned())
    }
}

struct CachedEntry {
    fetched_at: Instant,
    credentials: Option<Arc<StorageCredentials>>,
}

/// Resolves credentials keys through a bounded TTL cache
pub struct CredentialsResolver {
    source: Arc<dyn CredentialsSource>,
    default_credentials: Arc<StorageCredentials>,
    cache: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
}

impl CredentialsResolver {
    pub fn new(
        source: Arc<dyn CredentialsSource>,
        default_credentials: StorageCredentials,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            source,
            default_credentials: Arc::new(default_credentials),
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// The process-wide default credentials
    pub fn default_credentials(&self) -> Arc<StorageCredentials> {
        Arc::clone(&self.default_credentials)
    }

    /// Resolve a credentials key; `None` or an unknown key resolves to
    /// the process-wide default.
    pub async fn resolve(&self, key: Option<&str>) -> Result<Arc<StorageCredentials>> {
        let key = match key {
            Some(k) if !k.is_empty() => k,
            _ => return Ok(self.default_credentials()),
        };

        if let Some(hit) = self.lookup_fresh(key) {
            return Ok(hit.unwrap_or_else(|| self.default_credentials()));
        }

        let resolved = self.source.find_by_key(key).await?.map(Arc::new);
        if resolved.is_none() {
            debug!(key, "credentials key unknown, using default");
        }
        let mut cache = self.cache.lock();
        cache.put(
            key.to_string(),
            CachedEntry {
                fetched_at: Instant::now(),
                credentials: resolved.clone(),
            },
        );
        Ok(resolved.unwrap_or_else(|| self.default_credentials()))
    }

    fn lookup_fresh(&self, key: &str) -> Option<Option<Arc<StorageCredentials>>> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                Some(entry.credentials.clone())
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }
}
