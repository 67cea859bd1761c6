//! Storage tiers behind the cache engine.
//!
//! Two traits, each with an AWS implementation and an in-memory one for
//! tests: [`KvStore`] (DynamoDB) holds the structured record, and
//! [`BlobStore`] (S3) holds oversized records as JSON documents.
//!
//! Storage failures are never surfaced as errors past this boundary:
//! reads that fail are logged and reported as `None` (a cache miss),
//! writes that fail are logged and reported as `false`. The access path
//! proceeds either way.

#[cfg(feature = "dynamodb")]
mod dynamo;
mod fs;
mod memory;
#[cfg(feature = "s3-storage")]
mod s3;

use async_trait::async_trait;
#[cfg(feature = "dynamodb")]
pub use dynamo::DynamoKvStore;
pub use fs::FilesystemBlobStore;
pub use memory::{MemoryBlobStore, MemoryKvStore};
#[cfg(feature = "s3-storage")]
pub use s3::S3BlobStore;

use crate::cache::CacheRecord;

/// Structured record store, keyed by `id_hash`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Projection read of `{id_hash, data, expires}`. Failures are logged
    /// and mapped to `None`.
    async fn read(&self, id: &str) -> Option<CacheRecord>;

    /// Full-record write. Failures are logged and mapped to `false`.
    async fn write(&self, record: &CacheRecord) -> bool;

    /// Verify the store is reachable. For health endpoints; the access
    /// path never calls this.
    async fn health_check(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str;
}

/// Opaque JSON document store; one record per key at
/// `<prefix><id>.json`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, id: &str) -> Option<CacheRecord>;

    async fn write(&self, id: &str, record: &CacheRecord) -> bool;

    async fn health_check(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str;
}
