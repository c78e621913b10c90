//! The public surface: a thin, byte-oriented key-value cache in front of
//! the allocator and concurrent map. Mirrors the teacher's `cache/mod.rs`
//! shape (module doc up top, a handful of named defaults, re-exports) but
//! with values as raw `&[u8]` — serialization is the caller's job, not
//! this crate's.

use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::config::{AllocatorConfig, CacheConfig};
use crate::entry::ValueEntry;
use crate::error::Result;
use crate::map::{CacheStats, ConcurrentMap};
use crate::memory::{Allocator, AllocatorStats};

/// Reasonable default entry cap for callers that don't set `max_entries`
/// explicitly but do want eviction to kick in eventually.
pub const DEFAULT_MAX_ENTRIES: usize = 1_000_000;
/// Default total off-heap budget: 256 MiB.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 256 * 1024 * 1024;

pub struct NativeCache<K> {
    allocator: Allocator,
    map: ConcurrentMap<K>,
    max_entries: Option<usize>,
}

impl<K: Hash + Eq + Clone> NativeCache<K> {
    pub fn new(allocator_config: AllocatorConfig, cache_config: CacheConfig) -> Result<Self> {
        cache_config.validate()?;
        let max_entries = cache_config.max_entries;
        Ok(Self { allocator: Allocator::new(allocator_config)?, map: ConcurrentMap::new(&cache_config), max_entries })
    }

    /// Copies `value` into an off-heap buffer and installs it under `key`,
    /// replacing whatever was there before. Triggers eviction afterward if
    /// this put pushed the cache over its configured `max_entries`.
    pub fn set(&self, key: K, value: &[u8]) -> Result<()> {
        let mut buffer = self.allocator.allocate(value.len())?;
        buffer.write(0, value)?;
        self.map.put(key.clone(), ValueEntry::new(key, buffer));
        self.evict_if_over_capacity();
        Ok(())
    }

    /// Installs `value` under `key` only if nothing is stored there yet.
    /// Returns the value now live for `key` — either the one just inserted,
    /// or the pre-existing one (in which case `value` was copied off-heap
    /// and then immediately released again).
    pub fn put_if_absent(&self, key: K, value: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = self.allocator.allocate(value.len())?;
        buffer.write(0, value)?;
        let entry = self.map.put_if_absent(key.clone(), ValueEntry::new(key, buffer));
        self.evict_if_over_capacity();
        Ok(entry.value().to_vec())
    }

    pub fn get(&self, key: &K) -> Option<Vec<u8>> {
        self.map.get(key).map(|entry| entry.value().to_vec())
    }

    /// Returns the entry itself rather than a copy, for callers that want to
    /// inspect hit counts or age without an extra allocation.
    pub fn get_entry(&self, key: &K) -> Option<Arc<ValueEntry<K>>> {
        self.map.get(key)
    }

    pub fn exists(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Every key currently live in the cache. No global point-in-time
    /// consistency is guaranteed under concurrent mutation (see
    /// [`ConcurrentMap::iter_entries`]).
    pub fn keys(&self) -> Vec<K> {
        self.map.iter_entries().into_iter().map(|e| e.key.clone()).collect()
    }

    /// Every `(key, value)` pair currently live in the cache, copied out of
    /// off-heap storage. Intended for diagnostics and bulk export, not hot
    /// paths — it copies every value.
    pub fn entries(&self) -> Vec<(K, Vec<u8>)> {
        self.map.iter_entries().into_iter().map(|e| (e.key.clone(), e.value().to_vec())).collect()
    }

    pub fn stats(&self) -> CacheSnapshot {
        CacheSnapshot { cache: self.map.stats(), allocator: self.allocator.stats() }
    }

    fn evict_if_over_capacity(&self) {
        let Some(max) = self.max_entries else { return };
        let current = self.map.size();
        if current <= max {
            return;
        }
        let overflow = current - max;
        let victims = self.map.evict_candidates(overflow);
        debug!(count = victims.len(), "evicting entries over max_entries cap");
        for victim in victims {
            self.map.remove(&victim.key);
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheSnapshot {
    pub cache: CacheStats,
    pub allocator: AllocatorStats,
}

impl CacheSnapshot {
    /// Renders this snapshot as a JSON string, for callers that expose stats
    /// over an admin endpoint or log them structurally.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
