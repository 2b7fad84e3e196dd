//! Storage primitives and backend drivers for depot
//!
//! This crate provides the pieces bytes actually move through:
//! - the sharded locate strategy mapping content hashes to physical paths
//! - multi-digest hashing (sha256 primary, md5/sha1/crc64 legacy)
//! - `ArtifactFile`, the upload-side staging abstraction
//! - `BlockChannel`, range-addressable transfer over memory or disk
//! - the `FileStorage` driver contract with filesystem, S3, WebHDFS and
//!   signed object-store implementations, plus the shared chunked
//!   block-session operations

pub mod artifact;
pub mod block;
pub mod chunked;
pub mod driver;
pub mod hashing;
pub mod locate;
pub mod reader;

pub use artifact::ArtifactFile;
pub use block::{BlockChannel, FileBlockChannel, LazyBlockChannel, MemoryBlockChannel};
pub use chunked::BlockInfo;
pub use driver::cos::CosStorage;
pub use driver::filesystem::FilesystemStorage;
pub use driver::hdfs::HdfsStorage;
pub use driver::s3::S3Storage;
pub use driver::FileStorage;
pub use hashing::{ArtifactDigests, MultiHasher};
pub use locate::ShardedLocate;
pub use reader::ArtifactReader;
