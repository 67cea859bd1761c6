//! In-process memory tier (L0).
//!
//! A bounded fingerprint → payload map with LRU eviction. Expired
//! entries are not removed on read: they stay in place as *stale
//! candidates* so the error path can fall back to them when the storage
//! tiers are unavailable. The slot is rewritten once the upper layer
//! overwrites or extends the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use super::entry::CacheView;
use crate::config::MemoryCacheConfig;

/// Result of a memory-tier lookup.
#[derive(Debug)]
pub enum MemLookup {
    Hit(CacheView),
    /// Present but past its expiry; usable only as a stale candidate.
    Expired(CacheView),
    Miss,
}

struct MemEntry {
    view: CacheView,
    expires_at: i64,
    last_accessed: Instant,
}

/// Point-in-time stats, for logs and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MemCacheInfo {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct MemoryCache {
    entries: DashMap<String, MemEntry>,
    max_entries: usize,
    eviction_batch_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: config.effective_max_entries(),
            eviction_batch_size: config.eviction_batch_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &str, now: i64) -> MemLookup {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                if entry.expires_at > now {
                    entry.last_accessed = Instant::now();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    MemLookup::Hit(entry.view.clone())
                } else {
                    // Stale candidate: returned, not dropped.
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    MemLookup::Expired(entry.view.clone())
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                MemLookup::Miss
            }
        }
    }

    pub fn set(&self, id: &str, view: CacheView, expires_at: i64) {
        if !self.entries.contains_key(id) {
            self.evict_if_needed();
        }
        self.entries.insert(
            id.to_string(),
            MemEntry {
                view,
                expires_at,
                last_accessed: Instant::now(),
            },
        );
    }

    pub fn info(&self) -> MemCacheInfo {
        MemCacheInfo {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_if_needed(&self) {
        let len = self.entries.len();
        if len < self.max_entries {
            return;
        }

        // Room for the incoming entry plus a batch, oldest access first.
        let target = self
            .max_entries
            .saturating_sub(self.eviction_batch_size)
            .min(self.max_entries - 1);
        let to_evict = len.saturating_sub(target);

        let mut candidates: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed))
            .collect();
        candidates.sort_by_key(|(_, last_accessed)| *last_accessed);

        for (key, _) in candidates.into_iter().take(to_evict) {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
