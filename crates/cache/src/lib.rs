//! Local read-through cache for remote depot backends
//!
//! `CachedStorage` wraps a remote `FileStorage` driver with a local
//! mirror tree: reads are served from disk when a fresh mirror exists
//! and filled from the remote otherwise, writes go through to the
//! remote first with the mirror updated best-effort. `CacheEvictor`
//! reclaims mirror space on a TTL plus size budget.

pub mod cached;
pub mod evict;

pub use cached::CachedStorage;
pub use evict::{CacheEvictor, EvictionStats};
