//! Content-aware HTTP response caching.
//!
//! A layered cache that fronts arbitrary origin endpoints: responses are
//! served from fast storage when fresh, conditionally refreshed from the
//! origin (ETag / Last-Modified) when stale, and extended in place when the
//! origin is unreachable. Three tiers hold the data:
//!
//! - an in-process memory cache (optional, LRU + TTL);
//! - a key-value store (DynamoDB) holding the structured record;
//! - a blob store (S3) holding oversized records behind a stub.
//!
//! Entries classified `private` are encrypted at rest (AES-256-CBC by
//! default) with key material that may be raw bytes, a hex string, or a
//! lazily resolved secret.
//!
//! The request side is a redirect-safe HTTPS runtime with per-request
//! timeouts, a classifying retry loop, and transparent offset-based
//! pagination with bounded concurrency.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cprxy::access::CacheableAccess;
//! use cprxy::cache::CacheData;
//! use cprxy::config::{CacheDataConfig, CachePolicy};
//! use cprxy::crypto::KeyMaterial;
//! use cprxy::http::{ConnectionDescriptor, RequestRuntime};
//! use cprxy::storage::{MemoryBlobStore, MemoryKvStore};
//!
//! # async fn run() -> Result<(), cprxy::config::ConfigError> {
//! let config = CacheDataConfig {
//!     secure_data_key: Some(KeyMaterial::Hex(
//!         "a7".repeat(32),
//!     )),
//!     ..Default::default()
//! };
//! let data = Arc::new(CacheData::init(
//!     config,
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(MemoryBlobStore::new()),
//! )?);
//!
//! let access = CacheableAccess::new(data);
//! let runtime = RequestRuntime::default();
//! let connection = ConnectionDescriptor::get("https://api.example.com/games");
//!
//! let cache = access
//!     .get_data(
//!         CachePolicy::default(),
//!         &runtime,
//!         connection,
//!         serde_json::Value::Null,
//!         None,
//!     )
//!     .await;
//! let response = cache.generate_response_for_api_gateway(None, None);
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod http;
pub mod observability;
pub mod storage;

pub use access::{CacheableAccess, Fetch};
pub use cache::{Cache, CacheData, CacheView, DataSource, GatewayResponse};
pub use config::{CacheDataConfig, CachePolicy, ConfigError};
pub use http::{
    ConnectionDescriptor, FetchResponse, HttpEngine, Paginator, RequestRuntime, RetryEngine,
};
