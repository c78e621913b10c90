//! A single cached value: the bytes (in an off-heap [`ByteBuf`]) plus the
//! bookkeeping a segment needs for hit counting and eviction.
//!
//! Reference counting is expressed as plain [`Arc`] rather than a hand-rolled
//! atomic counter with `retain`/`release` methods — `Arc::clone` and `Drop`
//! already give exactly that semantic, safely, and a reader that clones an
//! entry out from under a segment's lock keeps its `ByteBuf` (and the chunk
//! memory behind it) alive for exactly as long as it holds that clone.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crate::memory::ByteBuf;

const NO_LRU_SLOT: usize = usize::MAX;

pub struct ValueEntry<K> {
    pub key: K,
    buffer: ByteBuf,
    hits: AtomicU64,
    create_time: Instant,
    lru_index: AtomicUsize,
}

impl<K> ValueEntry<K> {
    pub fn new(key: K, buffer: ByteBuf) -> Self {
        Self { key, buffer, hits: AtomicU64::new(0), create_time: Instant::now(), lru_index: AtomicUsize::new(NO_LRU_SLOT) }
    }

    pub fn value(&self) -> &ByteBuf {
        &self.buffer
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn age_secs(&self) -> f64 {
        self.create_time.elapsed().as_secs_f64()
    }

    /// The slab index this entry occupies in its segment's LRU list, once
    /// assigned by `put`.
    pub fn lru_index(&self) -> Option<usize> {
        match self.lru_index.load(Ordering::Acquire) {
            NO_LRU_SLOT => None,
            idx => Some(idx),
        }
    }

    pub fn set_lru_index(&self, index: usize) {
        self.lru_index.store(index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::memory::Allocator;

    #[test]
    fn hit_count_and_lru_index_track_independently() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let buf = alloc.allocate(8).unwrap();
        let entry = ValueEntry::new("k".to_string(), buf);

        assert_eq!(entry.hits(), 0);
        assert_eq!(entry.lru_index(), None);

        entry.record_hit();
        entry.record_hit();
        entry.set_lru_index(3);

        assert_eq!(entry.hits(), 2);
        assert_eq!(entry.lru_index(), Some(3));
    }
}
