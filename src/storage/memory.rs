//! In-memory storage backends for tests and local development.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BlobStore, KvStore};
use crate::cache::CacheRecord;

/// DashMap-backed [`KvStore`].
///
/// `fail_reads` / `fail_writes` simulate storage outages so the degraded
/// paths (stale fallback, swallowed write failures) can be exercised.
#[derive(Default)]
pub struct MemoryKvStore {
    items: DashMap<String, CacheRecord>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Direct record access for assertions and fault injection.
    pub fn get_raw(&self, id: &str) -> Option<CacheRecord> {
        self.items.get(id).map(|record| record.value().clone())
    }

    pub fn put_raw(&self, record: CacheRecord) {
        self.items.insert(record.id_hash.clone(), record);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn read(&self, id: &str) -> Option<CacheRecord> {
        if self.fail_reads.load(Ordering::SeqCst) {
            tracing::error!(id, "KV read failed (simulated)");
            return None;
        }
        self.items.get(id).map(|record| {
            // Match the projection: purge_ts is not returned by reads.
            let mut projected = record.value().clone();
            projected.purge_ts = 0;
            projected
        })
    }

    async fn write(&self, record: &CacheRecord) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            tracing::error!(id = %record.id_hash, "KV write failed (simulated)");
            return false;
        }
        self.items.insert(record.id_hash.clone(), record.clone());
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// DashMap-backed [`BlobStore`] storing serialized JSON documents.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, String>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The raw stored document, for assertions and corruption in tests.
    pub fn get_raw(&self, id: &str) -> Option<String> {
        self.objects.get(id).map(|object| object.value().clone())
    }

    pub fn put_raw(&self, id: impl Into<String>, document: impl Into<String>) {
        self.objects.insert(id.into(), document.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, id: &str) -> Option<CacheRecord> {
        if self.fail_reads.load(Ordering::SeqCst) {
            tracing::error!(id, "blob read failed (simulated)");
            return None;
        }
        let document = self.objects.get(id)?;
        match serde_json::from_str(document.as_str()) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(id, error = %e, "blob document failed to parse");
                None
            }
        }
    }

    async fn write(&self, id: &str, record: &CacheRecord) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            tracing::error!(id, "blob write failed (simulated)");
            return false;
        }
        match serde_json::to_string(record) {
            Ok(document) => {
                self.objects.insert(id.to_string(), document);
                true
            }
            Err(e) => {
                tracing::error!(id, error = %e, "record failed to serialize");
                false
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
