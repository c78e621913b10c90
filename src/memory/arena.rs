//! Per-arena chunk management: size classes, the qInit/q000/q025/q050/q075/q100
//! utilization bands, and the subpage free-list pools. Grounded in the
//! teacher's `BuddyAllocator` (`memory/allocator/zones.rs`) for the overall
//! shape of "a collection of backing allocations plus free lists",
//! generalized to the banded chunk lifecycle described for this allocator.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::AllocatorConfig;
use crate::error::{CacheError, Result};

use super::chunk::{Chunk, Handle};
use super::subpage::Subpage;

/// A live allocation: which chunk backs it, the handle to free it with, and
/// the normalized (rounded-up) size actually reserved.
pub struct Allocation {
    pub chunk: Arc<Chunk>,
    pub handle: Handle,
    pub normalized_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    QInit,
    Q000,
    Q025,
    Q050,
    Q075,
    Q100,
}

const SCAN_ORDER: [Band; 5] = [Band::Q050, Band::Q025, Band::Q000, Band::QInit, Band::Q075];

fn band_for_usage(usage: u32) -> Band {
    match usage {
        0..=24 => Band::Q000,
        25..=49 => Band::Q025,
        50..=74 => Band::Q050,
        75..=99 => Band::Q075,
        _ => Band::Q100,
    }
}

struct Bands {
    qinit: Vec<Arc<Chunk>>,
    q000: Vec<Arc<Chunk>>,
    q025: Vec<Arc<Chunk>>,
    q050: Vec<Arc<Chunk>>,
    q075: Vec<Arc<Chunk>>,
    q100: Vec<Arc<Chunk>>,
    chunk_count: usize,
}

impl Bands {
    fn list_mut(&mut self, band: Band) -> &mut Vec<Arc<Chunk>> {
        match band {
            Band::QInit => &mut self.qinit,
            Band::Q000 => &mut self.q000,
            Band::Q025 => &mut self.q025,
            Band::Q050 => &mut self.q050,
            Band::Q075 => &mut self.q075,
            Band::Q100 => &mut self.q100,
        }
    }

    fn list_for(&self, band: Band) -> &Vec<Arc<Chunk>> {
        match band {
            Band::QInit => &self.qinit,
            Band::Q000 => &self.q000,
            Band::Q025 => &self.q025,
            Band::Q050 => &self.q050,
            Band::Q075 => &self.q075,
            Band::Q100 => &self.q100,
        }
    }

    fn locate(&self, chunk: &Arc<Chunk>) -> Option<Band> {
        for band in [Band::QInit, Band::Q000, Band::Q025, Band::Q050, Band::Q075, Band::Q100] {
            if self.list_for(band).iter().any(|c| Arc::ptr_eq(c, chunk)) {
                return Some(band);
            }
        }
        None
    }

    /// Moves `chunk` to reflect its current usage, possibly destroying it.
    /// Mirrors qInit's "never proved useful" rule: a chunk that empties out
    /// again before ever leaving qInit is torn down instead of retained,
    /// while a chunk that already graduated out of qInit is kept around even
    /// at 0% usage since it has already proven worth reusing.
    fn restation(&mut self, chunk: &Arc<Chunk>, usage: u32) {
        let current = match self.locate(chunk) {
            Some(b) => b,
            None => return,
        };
        if current == Band::QInit {
            if usage == 0 {
                self.remove_from(Band::QInit, chunk);
                self.chunk_count -= 1;
                debug!(chunk_count = self.chunk_count, "destroying qInit chunk that never left qInit");
            } else if usage >= 25 {
                self.remove_from(Band::QInit, chunk);
                self.list_mut(band_for_usage(usage)).push(Arc::clone(chunk));
                debug!(?current, target = ?band_for_usage(usage), usage, "chunk graduated out of qInit");
            }
            return;
        }
        let target = band_for_usage(usage);
        if target != current {
            self.remove_from(current, chunk);
            self.list_mut(target).push(Arc::clone(chunk));
            debug!(?current, ?target, usage, "chunk moved band");
        }
    }

    fn remove_from(&mut self, band: Band, chunk: &Arc<Chunk>) {
        let list = self.list_mut(band);
        if let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, chunk)) {
            list.remove(pos);
        }
    }
}

pub struct Arena {
    page_size: usize,
    max_order: u8,
    chunk_size: usize,
    max_chunks: usize,
    size_classes: Vec<usize>,
    bands: Mutex<Bands>,
    subpage_pools: Vec<Mutex<Vec<(Arc<Chunk>, Arc<Subpage>)>>>,
    allocated_bytes: AtomicUsize,
    unpooled_bytes: AtomicUsize,
}

/// The size-class table for [`crate::config::PAGE_SIZE`], computed once per
/// process: every arena built with the default page size shares it instead
/// of rebuilding the same `Vec` on every construction. Mirrors the teacher's
/// `once_cell::sync::Lazy` static size-class table in
/// `enterprise_optimization/memory_optimizer.rs`.
static DEFAULT_SIZE_CLASSES: once_cell::sync::Lazy<Vec<usize>> =
    once_cell::sync::Lazy::new(|| compute_size_classes(crate::config::PAGE_SIZE));

fn build_size_classes(page_size: usize) -> Vec<usize> {
    if page_size == crate::config::PAGE_SIZE {
        DEFAULT_SIZE_CLASSES.clone()
    } else {
        compute_size_classes(page_size)
    }
}

fn compute_size_classes(page_size: usize) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut s = 16usize;
    let tiny_ceiling = 512.min(page_size);
    while s < tiny_ceiling {
        classes.push(s);
        s += 16;
    }
    while s < page_size {
        classes.push(s);
        s *= 2;
    }
    classes
}

fn normalize_capacity(requested: usize, classes: &[usize], page_size: usize, chunk_size: usize) -> usize {
    if requested == 0 {
        return classes.first().copied().unwrap_or(page_size);
    }
    if requested > chunk_size {
        return requested;
    }
    if requested >= page_size {
        return requested.next_power_of_two().max(page_size);
    }
    for &c in classes {
        if c >= requested {
            return c;
        }
    }
    page_size
}

impl Arena {
    pub fn new(config: &AllocatorConfig, page_size: usize, max_order: u8, chunk_size: usize) -> Self {
        let size_classes = build_size_classes(page_size);
        let max_chunks = (config.per_arena_budget() / chunk_size).max(1);
        let subpage_pools = size_classes.iter().map(|_| Mutex::new(Vec::new())).collect();
        Self {
            page_size,
            max_order,
            chunk_size,
            max_chunks,
            size_classes,
            bands: Mutex::new(Bands {
                qinit: Vec::new(),
                q000: Vec::new(),
                q025: Vec::new(),
                q050: Vec::new(),
                q075: Vec::new(),
                q100: Vec::new(),
                chunk_count: 0,
            }),
            subpage_pools,
            allocated_bytes: AtomicUsize::new(0),
            unpooled_bytes: AtomicUsize::new(0),
        }
    }

    pub fn allocate(&self, requested: usize) -> Result<Allocation> {
        let norm = normalize_capacity(requested, &self.size_classes, self.page_size, self.chunk_size);

        if norm > self.chunk_size {
            let chunk = Chunk::new_unpooled(norm).ok_or_else(|| {
                warn!(requested, normalized = norm, "allocation failed: system allocator returned null for unpooled request");
                CacheError::AllocationFailure { requested, reason: "system allocator returned null for unpooled request".into() }
            })?;
            self.unpooled_bytes.fetch_add(norm, Ordering::Relaxed);
            return Ok(Allocation { chunk: Arc::new(chunk), handle: Handle::whole_region(), normalized_size: norm });
        }

        let allocation = if norm >= self.page_size {
            self.allocate_run(norm / self.page_size, norm)?
        } else {
            self.allocate_subpage(norm)?
        };
        self.allocated_bytes.fetch_add(norm, Ordering::Relaxed);
        Ok(allocation)
    }

    fn allocate_run(&self, pages: usize, norm: usize) -> Result<Allocation> {
        let mut bands = self.bands.lock();
        for band in SCAN_ORDER {
            for chunk in bands.list_for(band).clone() {
                if let Some(handle) = chunk.allocate_run(pages as u32) {
                    bands.restation(&chunk, chunk.usage());
                    return Ok(Allocation { chunk, handle, normalized_size: norm });
                }
            }
        }
        let chunk = self.new_chunk(&mut bands)?;
        let handle = chunk
            .allocate_run(pages as u32)
            .expect("fresh chunk must satisfy a request no larger than itself");
        bands.restation(&chunk, chunk.usage());
        Ok(Allocation { chunk, handle, normalized_size: norm })
    }

    fn allocate_subpage(&self, norm: usize) -> Result<Allocation> {
        let class_idx = self
            .size_classes
            .iter()
            .position(|&c| c == norm)
            .expect("normalize_capacity only returns known size classes below page_size");
        let pool = &self.subpage_pools[class_idx];
        // Peek-then-lock-again below is a benign race under contention: two
        // threads can both peek the same candidate subpage, and one loses
        // the `allocate_subpage_in` race and just loops to the next
        // candidate. `allocate_subpage_in`'s own bitmap lock is what
        // actually guards against a double-allocation of the same slot.
        loop {
            let candidate = {
                let mut entries = pool.lock();
                entries.last().cloned()
            };
            let Some((chunk, subpage)) = candidate else { break };
            match chunk.allocate_subpage_in(&subpage) {
                Some(handle) => {
                    if subpage_is_full(&subpage) {
                        pool.lock().pop();
                    }
                    let mut bands = self.bands.lock();
                    bands.restation(&chunk, chunk.usage());
                    return Ok(Allocation { chunk, handle, normalized_size: norm });
                }
                None => {
                    pool.lock().pop();
                }
            }
        }

        let mut bands = self.bands.lock();
        let chunk = match self.find_chunk_with_room(&bands) {
            Some(c) => c,
            None => self.new_chunk(&mut bands)?,
        };
        let (handle, subpage) = chunk.new_subpage(norm).ok_or_else(|| {
            warn!(requested = norm, "allocation failed: no free page left for a new subpage");
            CacheError::AllocationFailure { requested: norm, reason: "no free page in arena".into() }
        })?;
        bands.restation(&chunk, chunk.usage());
        if !subpage_is_full(&subpage) {
            pool.lock().push((Arc::clone(&chunk), subpage));
        }
        Ok(Allocation { chunk, handle, normalized_size: norm })
    }

    fn find_chunk_with_room(&self, bands: &Bands) -> Option<Arc<Chunk>> {
        for band in SCAN_ORDER {
            if let Some(chunk) = bands.list_for(band).first() {
                return Some(Arc::clone(chunk));
            }
        }
        None
    }

    fn new_chunk(&self, bands: &mut Bands) -> Result<Arc<Chunk>> {
        if bands.chunk_count >= self.max_chunks {
            warn!(max_chunks = self.max_chunks, chunk_size = self.chunk_size, "allocation failed: arena at its configured chunk budget");
            return Err(CacheError::AllocationFailure {
                requested: self.chunk_size,
                reason: format!("arena already holds its configured maximum of {} chunks", self.max_chunks),
            });
        }
        let chunk = Arc::new(Chunk::new_pooled(self.page_size, self.max_order).ok_or_else(|| {
            warn!(chunk_size = self.chunk_size, "allocation failed: system allocator returned null for a new chunk");
            CacheError::AllocationFailure { requested: self.chunk_size, reason: "system allocator returned null".into() }
        })?);
        bands.qinit.push(Arc::clone(&chunk));
        bands.chunk_count += 1;
        debug!(chunk_count = bands.chunk_count, chunk_size = self.chunk_size, "created chunk into qInit");
        Ok(chunk)
    }

    pub fn free(&self, chunk: &Arc<Chunk>, handle: Handle, normalized_size: usize) {
        if chunk.is_unpooled() {
            self.unpooled_bytes.fetch_sub(normalized_size, Ordering::Relaxed);
            return;
        }
        self.allocated_bytes.fetch_sub(normalized_size, Ordering::Relaxed);
        if let Some((subpage, result)) = chunk.free(handle) {
            if let Some(class_idx) = self.size_classes.iter().position(|&c| c == normalized_size) {
                if result.became_available {
                    self.subpage_pools[class_idx].lock().push((Arc::clone(chunk), subpage));
                } else if result.destroyed {
                    // The page behind this subpage was just handed back to
                    // the chunk's tree (see `Chunk::free`), so the pool must
                    // drop its reference too — otherwise a later
                    // `allocate_subpage` can peek this dead entry, succeed
                    // against its (reset) bitmap, and hand out a handle whose
                    // backing page no longer exists as this subpage.
                    let mut pool = self.subpage_pools[class_idx].lock();
                    if let Some(pos) = pool.iter().position(|(c, sp)| Arc::ptr_eq(c, chunk) && Arc::ptr_eq(sp, &subpage)) {
                        pool.remove(pos);
                    }
                }
            }
        }
        let mut bands = self.bands.lock();
        bands.restation(chunk, chunk.usage());
    }

    /// Rounds `requested` up the same way `allocate` would, without
    /// performing the allocation. Lets a [`super::thread_cache::ThreadCache`]
    /// check its own pools before touching this arena's locks.
    pub fn normalize(&self, requested: usize) -> usize {
        normalize_capacity(requested, &self.size_classes, self.page_size, self.chunk_size)
    }

    /// Index into this arena's subpage size classes, if `size` is one of them.
    pub fn size_class_index(&self, size: usize) -> Option<usize> {
        self.size_classes.iter().position(|&c| c == size)
    }

    pub fn size_class_count(&self) -> usize {
        self.size_classes.len()
    }

    pub fn stats(&self) -> ArenaStats {
        let bands = self.bands.lock();
        ArenaStats {
            chunk_count: bands.chunk_count,
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            unpooled_bytes: self.unpooled_bytes.load(Ordering::Relaxed),
        }
    }
}

/// `allocate`-then-immediately-`free` probe: true if that round trip would
/// have found `subpage` already at capacity before the probe.
fn subpage_is_full(subpage: &Arc<Subpage>) -> bool {
    match subpage.allocate() {
        Some(r) => {
            subpage.free(r.bit_index);
            false
        }
        None => true,
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ArenaStats {
    pub chunk_count: usize,
    pub allocated_bytes: usize,
    pub unpooled_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        let cfg = AllocatorConfig { max_memory_size: 64 * 1024, arena_count: Some(1) };
        Arena::new(&cfg, 64, 4, 1024)
    }

    #[test]
    fn small_allocation_rounds_to_size_class() {
        let arena = test_arena();
        let a = arena.allocate(10).unwrap();
        assert_eq!(a.normalized_size, 16);
        arena.free(&a.chunk, a.handle, a.normalized_size);
    }

    #[test]
    fn run_allocation_rounds_to_page_multiple() {
        let arena = test_arena();
        let a = arena.allocate(100).unwrap();
        assert_eq!(a.normalized_size, 128);
        arena.free(&a.chunk, a.handle, a.normalized_size);
    }

    #[test]
    fn oversized_request_goes_unpooled() {
        let arena = test_arena();
        let a = arena.allocate(4096).unwrap();
        assert!(a.chunk.is_unpooled());
        assert_eq!(a.normalized_size, 4096);
        arena.free(&a.chunk, a.handle, a.normalized_size);
        assert_eq!(arena.stats().unpooled_bytes, 0);
    }

    #[test]
    fn many_small_allocations_reuse_and_free() {
        let arena = test_arena();
        let mut allocs = Vec::new();
        for _ in 0..20 {
            allocs.push(arena.allocate(16).unwrap());
        }
        for a in allocs {
            arena.free(&a.chunk, a.handle, a.normalized_size);
        }
        assert_eq!(arena.stats().allocated_bytes, 0);
    }

    #[test]
    fn exhausting_budget_yields_allocation_failure() {
        let cfg = AllocatorConfig { max_memory_size: 1024, arena_count: Some(1) };
        let arena = Arena::new(&cfg, 64, 4, 1024);
        let _a = arena.allocate(1024).unwrap();
        let err = arena.allocate(1024).unwrap_err();
        assert!(matches!(err, CacheError::AllocationFailure { .. }));
    }

    #[test]
    fn destroyed_subpage_does_not_linger_in_the_pool() {
        // page_size=64, class 32 -> 2 slots per page, small enough to drive
        // a subpage through "has room" -> "full" -> "has room again" ->
        // "destroyed" in four allocate/free calls.
        let arena = test_arena();
        let class_idx = arena.size_class_index(32).unwrap();

        let a = arena.allocate(32).unwrap();
        let b = arena.allocate(32).unwrap();
        assert_eq!(arena.subpage_pools[class_idx].lock().len(), 0, "the page filled by the second alloc should have been popped");

        arena.free(&a.chunk, a.handle, a.normalized_size);
        assert_eq!(arena.subpage_pools[class_idx].lock().len(), 1, "freeing one of two slots re-lists the subpage as available");

        arena.free(&b.chunk, b.handle, b.normalized_size);
        assert_eq!(arena.subpage_pools[class_idx].lock().len(), 0, "freeing the last slot destroys the subpage; it must not linger in the pool");

        // Without the fix this would peek the stale pool entry and panic in
        // `Chunk::offset_of` against a page the tree had already reclaimed.
        let c = arena.allocate(32).unwrap();
        assert_eq!(c.normalized_size, 32);
        arena.free(&c.chunk, c.handle, c.normalized_size);
    }
}
