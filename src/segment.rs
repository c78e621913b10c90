//! One stripe of the concurrent map: its own bucket table, its own
//! reader/writer lock, its own LRU ordering. Grounded in the teacher's
//! `ConcurrentHashMap` segment-per-bucket-group shape (`concurrent/hashmap.rs`),
//! reworked from that file's spinlock-per-bucket-cacheline design to a single
//! `parking_lot::RwLock` per segment — the teacher already exposes that type
//! as `PRwLock` in `memory/buffer_pool/common.rs`, and it gives genuinely
//! concurrent readers without hand-rolled epoch reclamation.

use parking_lot::RwLock as PRwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::entry::ValueEntry;
use crate::lru::Lru;

const NIL: usize = usize::MAX;

struct Slot<K> {
    hash: u64,
    entry: Arc<ValueEntry<K>>,
    next: usize,
}

struct SegmentState<K> {
    buckets: Vec<usize>,
    slab: Vec<Option<Slot<K>>>,
    free: Vec<usize>,
    lru: Lru,
    len: usize,
}

pub struct Segment<K> {
    state: PRwLock<SegmentState<K>>,
    mod_count: AtomicU64,
    len_hint: AtomicUsize,
    load_factor: f64,
}

impl<K: Eq> Segment<K> {
    pub fn new(initial_buckets: usize, load_factor: f64) -> Self {
        let buckets = initial_buckets.max(1).next_power_of_two();
        Self {
            state: PRwLock::new(SegmentState {
                buckets: vec![NIL; buckets],
                slab: Vec::new(),
                free: Vec::new(),
                lru: Lru::new(),
                len: 0,
            }),
            mod_count: AtomicU64::new(0),
            len_hint: AtomicUsize::new(0),
            load_factor,
        }
    }

    /// Lock-free snapshot of the live entry count. Paired with `mod_count`
    /// by the map's `size()` to detect whether a segment mutated mid-scan.
    pub fn len(&self) -> usize {
        self.len_hint.load(Ordering::Acquire)
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    pub fn get(&self, hash: u64, key: &K) -> Option<Arc<ValueEntry<K>>> {
        let state = self.state.read();
        let bucket = (hash as usize) & (state.buckets.len() - 1);
        let mut idx = state.buckets[bucket];
        while idx != NIL {
            let slot = state.slab[idx].as_ref().expect("live bucket index must have a slot");
            if slot.hash == hash && slot.entry.key == *key {
                let entry = Arc::clone(&slot.entry);
                entry.record_hit();
                drop(state);
                // Best-effort promotion: skip reordering rather than block a
                // reader behind a writer. Exact LRU order under contention
                // is explicitly not guaranteed.
                if let Some(mut w) = self.state.try_write() {
                    w.lru.promote(idx);
                }
                return Some(entry);
            }
            idx = slot.next;
        }
        None
    }

    pub fn contains(&self, hash: u64, key: &K) -> bool {
        let state = self.state.read();
        let bucket = (hash as usize) & (state.buckets.len() - 1);
        let mut idx = state.buckets[bucket];
        while idx != NIL {
            let slot = state.slab[idx].as_ref().expect("live bucket index must have a slot");
            if slot.hash == hash && slot.entry.key == *key {
                return true;
            }
            idx = slot.next;
        }
        false
    }

    /// Inserts or replaces the entry for `key`, returning the value that was
    /// there before (if any) so the caller can drop it outside any lock.
    pub fn put(&self, hash: u64, key: K, value: ValueEntry<K>) -> Option<Arc<ValueEntry<K>>> {
        let mut state = self.state.write();
        if (state.len + 1) as f64 > state.buckets.len() as f64 * self.load_factor {
            self.rehash(&mut state);
        }
        let bucket = (hash as usize) & (state.buckets.len() - 1);

        let mut idx = state.buckets[bucket];
        while idx != NIL {
            let next = state.slab[idx].as_ref().unwrap().next;
            let matches = {
                let slot = state.slab[idx].as_ref().unwrap();
                slot.hash == hash && slot.entry.key == key
            };
            if matches {
                let new_entry = Arc::new(value);
                new_entry.set_lru_index(idx);
                let old = std::mem::replace(&mut state.slab[idx].as_mut().unwrap().entry, new_entry);
                state.lru.promote(idx);
                self.mod_count.fetch_add(1, Ordering::Release);
                return Some(old);
            }
            idx = next;
        }

        let slab_idx = match state.free.pop() {
            Some(i) => i,
            None => {
                state.slab.push(None);
                state.slab.len() - 1
            }
        };
        let entry = Arc::new(value);
        entry.set_lru_index(slab_idx);
        let head = state.buckets[bucket];
        state.slab[slab_idx] = Some(Slot { hash, entry, next: head });
        state.buckets[bucket] = slab_idx;
        state.lru.insert_front(slab_idx);
        state.len += 1;
        self.len_hint.store(state.len, Ordering::Release);
        self.mod_count.fetch_add(1, Ordering::Release);
        let _ = key;
        None
    }

    /// Inserts `value` only if `key` is absent, returning whichever entry is
    /// live afterward — the pre-existing one, or the freshly inserted one.
    /// The caller's `value` is simply dropped (and its buffer released) when
    /// an existing entry wins.
    pub fn put_if_absent(&self, hash: u64, key: K, value: ValueEntry<K>) -> Arc<ValueEntry<K>> {
        let mut state = self.state.write();
        let bucket = (hash as usize) & (state.buckets.len() - 1);
        let mut idx = state.buckets[bucket];
        while idx != NIL {
            let slot = state.slab[idx].as_ref().unwrap();
            if slot.hash == hash && slot.entry.key == key {
                return Arc::clone(&slot.entry);
            }
            idx = slot.next;
        }

        if (state.len + 1) as f64 > state.buckets.len() as f64 * self.load_factor {
            self.rehash(&mut state);
        }
        let bucket = (hash as usize) & (state.buckets.len() - 1);
        let slab_idx = match state.free.pop() {
            Some(i) => i,
            None => {
                state.slab.push(None);
                state.slab.len() - 1
            }
        };
        let entry = Arc::new(value);
        entry.set_lru_index(slab_idx);
        let result = Arc::clone(&entry);
        let head = state.buckets[bucket];
        state.slab[slab_idx] = Some(Slot { hash, entry, next: head });
        state.buckets[bucket] = slab_idx;
        state.lru.insert_front(slab_idx);
        state.len += 1;
        self.len_hint.store(state.len, Ordering::Release);
        self.mod_count.fetch_add(1, Ordering::Release);
        result
    }

    pub fn remove(&self, hash: u64, key: &K) -> Option<Arc<ValueEntry<K>>> {
        let mut state = self.state.write();
        let bucket = (hash as usize) & (state.buckets.len() - 1);
        let mut idx = state.buckets[bucket];
        let mut prev: Option<usize> = None;
        while idx != NIL {
            let next = state.slab[idx].as_ref().unwrap().next;
            let matches = {
                let slot = state.slab[idx].as_ref().unwrap();
                slot.hash == hash && slot.entry.key == *key
            };
            if matches {
                match prev {
                    Some(p) => state.slab[p].as_mut().unwrap().next = next,
                    None => state.buckets[bucket] = next,
                }
                state.lru.remove(idx);
                let removed = state.slab[idx].take().unwrap();
                state.free.push(idx);
                state.len -= 1;
                self.len_hint.store(state.len, Ordering::Release);
                self.mod_count.fetch_add(1, Ordering::Release);
                return Some(removed.entry);
            }
            prev = Some(idx);
            idx = next;
        }
        None
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        let bucket_count = state.buckets.len();
        *state = SegmentState { buckets: vec![NIL; bucket_count], slab: Vec::new(), free: Vec::new(), lru: Lru::new(), len: 0 };
        self.len_hint.store(0, Ordering::Release);
        self.mod_count.fetch_add(1, Ordering::Release);
    }

    /// A point-in-time snapshot of every live entry in this segment, for
    /// callers that need to iterate the whole cache (e.g. a `keys()`/
    /// `entries()` surface on the facade). Taken under a single read lock,
    /// so it reflects no single global instant across segments but is
    /// internally consistent for this one.
    pub fn snapshot(&self) -> Vec<Arc<ValueEntry<K>>> {
        let state = self.state.read();
        state.slab.iter().filter_map(|slot| slot.as_ref().map(|s| Arc::clone(&s.entry))).collect()
    }

    /// Up to `n` least-recently-used live entries in this segment.
    pub fn evict_candidates(&self, n: usize) -> Vec<Arc<ValueEntry<K>>> {
        let state = self.state.read();
        state
            .lru
            .victims(n)
            .into_iter()
            .filter_map(|idx| state.slab[idx].as_ref().map(|slot| Arc::clone(&slot.entry)))
            .collect()
    }

    fn rehash(&self, state: &mut SegmentState<K>) {
        let new_count = state.buckets.len() * 2;
        let mut new_buckets = vec![NIL; new_count];
        for slab_idx in 0..state.slab.len() {
            if let Some(slot) = state.slab[slab_idx].as_mut() {
                let bucket = (slot.hash as usize) & (new_count - 1);
                slot.next = new_buckets[bucket];
                new_buckets[bucket] = slab_idx;
            }
        }
        state.buckets = new_buckets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::memory::Allocator;

    fn entry(alloc: &Allocator, key: &str, payload: &[u8]) -> ValueEntry<String> {
        let mut buf = alloc.allocate(payload.len()).unwrap();
        buf.write(0, payload).unwrap();
        ValueEntry::new(key.to_string(), buf)
    }

    fn h(key: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn put_then_get_round_trips() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(4, 0.75);
        seg.put(h("a"), "a".into(), entry(&alloc, "a", b"1"));
        let got = seg.get(h("a"), &"a".to_string()).unwrap();
        assert_eq!(got.value().to_vec(), b"1");
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn put_replaces_existing_key() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(4, 0.75);
        seg.put(h("a"), "a".into(), entry(&alloc, "a", b"1"));
        let old = seg.put(h("a"), "a".into(), entry(&alloc, "a", b"2"));
        assert_eq!(old.unwrap().value().to_vec(), b"1");
        assert_eq!(seg.len(), 1);
        assert_eq!(seg.get(h("a"), &"a".to_string()).unwrap().value().to_vec(), b"2");
    }

    #[test]
    fn remove_drops_entry_and_updates_len() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(4, 0.75);
        seg.put(h("a"), "a".into(), entry(&alloc, "a", b"1"));
        let removed = seg.remove(h("a"), &"a".to_string());
        assert!(removed.is_some());
        assert_eq!(seg.len(), 0);
        assert!(seg.get(h("a"), &"a".to_string()).is_none());
    }

    #[test]
    fn rehash_preserves_all_entries() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(2, 0.75);
        for i in 0..50 {
            let k = format!("k{i}");
            seg.put(h(&k), k.clone(), entry(&alloc, &k, b"v"));
        }
        assert_eq!(seg.len(), 50);
        for i in 0..50 {
            let k = format!("k{i}");
            assert!(seg.get(h(&k), &k).is_some(), "missing {k} after rehash");
        }
    }

    #[test]
    fn evict_candidates_return_least_recently_used_first() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(8, 0.75);
        seg.put(h("a"), "a".into(), entry(&alloc, "a", b"1"));
        seg.put(h("b"), "b".into(), entry(&alloc, "b", b"1"));
        seg.put(h("c"), "c".into(), entry(&alloc, "c", b"1"));
        seg.get(h("a"), &"a".to_string());
        let victims = seg.evict_candidates(2);
        let keys: Vec<&str> = victims.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn put_if_absent_keeps_first_value() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(4, 0.75);
        let first = seg.put_if_absent(h("a"), "a".into(), entry(&alloc, "a", b"v1"));
        assert_eq!(first.value().to_vec(), b"v1");
        let second = seg.put_if_absent(h("a"), "a".into(), entry(&alloc, "a", b"v2"));
        assert_eq!(second.value().to_vec(), b"v1");
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn clear_empties_segment() {
        let alloc = Allocator::new(AllocatorConfig::default()).unwrap();
        let seg: Segment<String> = Segment::new(4, 0.75);
        seg.put(h("a"), "a".into(), entry(&alloc, "a", b"1"));
        seg.clear();
        assert_eq!(seg.len(), 0);
        assert!(seg.get(h("a"), &"a".to_string()).is_none());
    }
}
