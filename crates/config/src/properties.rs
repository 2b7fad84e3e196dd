//! Cache, upload, and preload configuration surfaces

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Local cache configuration attached to a set of credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether a local mirror fronts this backend at all
    pub enabled: bool,
    /// Root of the local mirror tree
    pub path: PathBuf,
    /// Entries older than this are eligible for eviction
    pub expire: Duration,
    /// Size budget for the mirror tree (0 = unbounded)
    pub max_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("cache"),
            expire: Duration::from_secs(7 * 24 * 3600),
            max_size: 0,
        }
    }
}

/// Upload staging configuration attached to a set of credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Staging directory for in-flight uploads and chunked block sessions
    pub location: PathBuf,
    /// Artifacts above this size spill from memory to a staging file
    pub spill_threshold: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            location: std::env::temp_dir().join("depot-upload"),
            spill_threshold: 1024 * 1024,
        }
    }
}

/// Preload and access-bookkeeping configuration
///
/// `min_access_interval`, `min_size`, and `only_record_cache_miss` also
/// govern the cache layer's access bookkeeping: last-access time is only
/// refreshed when the interval has elapsed and the entry is big enough,
/// so small frequent reads do not dominate metadata write load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadProperties {
    pub enabled: bool,
    /// Minimum gap between two access-time refreshes of one entry
    pub min_access_interval: Duration,
    /// Record accesses only when they were cache misses
    pub only_record_cache_miss: bool,
    /// Entries below this size never get access bookkeeping
    pub min_size: u64,
    /// How long access records are kept before aging out
    pub access_record_keep_duration: Duration,
    /// Maximum preload strategies per repository
    pub max_strategy_count: usize,
    /// Artifacts older than this are never preloaded
    pub max_artifact_exists_duration: Duration,
    /// Wall-clock budget for one preload plan, covering both planning
    /// and execution; whatever finished before it runs out is kept
    pub plan_timeout: Duration,
    /// Size of the preload worker pool
    pub preload_concurrency: usize,
    /// Hours of day (0-23) at which preload may start when no cron is set
    pub preload_hour_of_day: Vec<u8>,
    /// Upper bound on the random jitter subtracted from the start time
    pub max_random_seconds: u64,
    /// Hashes referenced by more nodes than this are skipped in planning
    pub max_nodes: u64,
    /// Log intended fetches without performing them
    pub mock: bool,
}

impl Default for PreloadProperties {
    fn default() -> Self {
        Self {
            enabled: false,
            min_access_interval: Duration::from_secs(60),
            only_record_cache_miss: false,
            min_size: 4096,
            access_record_keep_duration: Duration::from_secs(7 * 24 * 3600),
            max_strategy_count: 10,
            max_artifact_exists_duration: Duration::from_secs(24 * 3600),
            plan_timeout: Duration::from_secs(300),
            preload_concurrency: 8,
            preload_hour_of_day: vec![2],
            max_random_seconds: 600,
            max_nodes: 100,
            mock: false,
        }
    }
}
