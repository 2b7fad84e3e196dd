//! Configuration model for the depot storage engine
//!
//! Storage credentials describe a named backend (type, connection
//! parameters, cache and upload settings). Repositories reference
//! credentials by key; an unconfigured repository falls back to a
//! process-wide default. Resolution goes through a short-TTL cache so
//! repeated calls do not hit the configuration service.

pub mod credentials;
pub mod properties;
pub mod resolver;

pub use credentials::{BackendConfig, BackendKind, StorageCredentials};
pub use properties::{CacheSettings, PreloadProperties, UploadSettings};
pub use resolver::{CredentialsResolver, CredentialsSource, StaticCredentialsSource};
