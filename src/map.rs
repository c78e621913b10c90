//! The striped concurrent map itself: hashes a key to a segment, then
//! delegates. Grounded in the teacher's `ConcurrentHashMap` for the overall
//! segment-plus-spread-hash shape, generalized here to plain `Segment<K>`
//! stripes behind `parking_lot` locks instead of per-bucket spinlocks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::ValueEntry;
use crate::segment::Segment;

/// Mixes a hash's high and low bits together so that keys which differ only
/// in their low bits (small sequential integers, for instance) still spread
/// across segments instead of clustering in one.
fn spread(h: u64) -> u64 {
    let h = h ^ (h >> 33);
    h ^ (h >> 15)
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct ConcurrentMap<K> {
    segments: Vec<Segment<K>>,
    mask: usize,
}

impl<K: Hash + Eq> ConcurrentMap<K> {
    pub fn new(config: &CacheConfig) -> Self {
        let segment_count = config.segment_count();
        let per_segment_buckets = (config.initial_capacity / segment_count).max(1);
        let segments = (0..segment_count).map(|_| Segment::new(per_segment_buckets, config.load_factor)).collect();
        Self { segments, mask: segment_count - 1 }
    }

    fn locate(&self, key: &K) -> (usize, u64) {
        let spread_hash = spread(hash_key(key));
        let segment_idx = (spread_hash as usize) & self.mask;
        (segment_idx, spread_hash)
    }

    pub fn get(&self, key: &K) -> Option<Arc<ValueEntry<K>>> {
        let (idx, hash) = self.locate(key);
        self.segments[idx].get(hash, key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let (idx, hash) = self.locate(key);
        self.segments[idx].contains(hash, key)
    }

    pub fn put(&self, key: K, value: ValueEntry<K>) -> Option<Arc<ValueEntry<K>>> {
        let (idx, hash) = self.locate(&key);
        self.segments[idx].put(hash, key, value)
    }

    /// Installs `value` only if `key` is absent; otherwise drops `value` and
    /// returns the entry already present.
    pub fn put_if_absent(&self, key: K, value: ValueEntry<K>) -> Arc<ValueEntry<K>> {
        let (idx, hash) = self.locate(&key);
        self.segments[idx].put_if_absent(hash, key, value)
    }

    pub fn remove(&self, key: &K) -> Option<Arc<ValueEntry<K>>> {
        let (idx, hash) = self.locate(key);
        self.segments[idx].remove(hash, key)
    }

    pub fn clear(&self) {
        for segment in &self.segments {
            segment.clear();
        }
    }

    /// Sums each segment's lock-free length snapshot, re-checking every
    /// segment's `mod_count` before and after the pass. If nothing mutated
    /// mid-scan the sum is exact; otherwise it is a best-effort estimate —
    /// precise `size()` under concurrent mutation is not guaranteed.
    pub fn size(&self) -> usize {
        for _ in 0..2 {
            let before: Vec<u64> = self.segments.iter().map(Segment::mod_count).collect();
            let sum: usize = self.segments.iter().map(Segment::len).sum();
            let stable = self.segments.iter().zip(&before).all(|(s, &b)| s.mod_count() == b);
            if stable {
                return sum;
            }
        }
        self.segments.iter().map(Segment::len).sum()
    }

    /// Up to `n` eviction candidates, round-robining across segments so no
    /// single hot segment dominates the list. Each segment contributes its
    /// own least-recently-used entries first; there is no cross-segment
    /// ordering guarantee beyond that.
    pub fn evict_candidates(&self, n: usize) -> Vec<Arc<ValueEntry<K>>> {
        let mut per_segment: Vec<Vec<Arc<ValueEntry<K>>>> = self.segments.iter().map(|s| s.evict_candidates(n)).collect();
        let mut out = Vec::with_capacity(n);
        loop {
            if out.len() >= n {
                break;
            }
            let mut progressed = false;
            for bucket in per_segment.iter_mut() {
                if out.len() >= n {
                    break;
                }
                if !bucket.is_empty() {
                    out.push(bucket.remove(0));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// A snapshot of every live entry across all segments. No single global
    /// instant is guaranteed (each segment is sampled independently), the
    /// same caveat `size()` documents for concurrent mutation.
    pub fn iter_entries(&self) -> Vec<Arc<ValueEntry<K>>> {
        self.segments.iter().flat_map(Segment::snapshot).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { segment_count: self.segments.len(), approximate_len: self.size() }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub segment_count: usize,
    pub approximate_len: usize,
}
