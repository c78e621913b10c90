//! Public allocator facade: owns the arena array, assigns each thread a
//! sticky arena plus [`ThreadCache`], and hands out [`ByteBuf`] handles.
//! Grounded in the teacher's `memory/allocator/mod.rs` re-export shape for
//! "one facade type fronting many internal pieces".

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{AllocatorConfig, CHUNK_SIZE, MAX_ORDER, PAGE_SIZE};
use crate::error::{CacheError, Result};

use super::arena::{Arena, ArenaStats};
use super::chunk::{Chunk, Handle};
use super::thread_cache::ThreadCache;

static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_CACHES: RefCell<HashMap<usize, Rc<ThreadCache>>> = RefCell::new(HashMap::new());
}

pub struct Allocator {
    id: usize,
    arenas: Vec<Arc<Arena>>,
    next_arena: AtomicUsize,
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let arena_count = config.resolved_arena_count();
        let arenas = (0..arena_count).map(|_| Arc::new(Arena::new(&config, PAGE_SIZE, MAX_ORDER as u8, CHUNK_SIZE))).collect();
        Ok(Self { id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed), arenas, next_arena: AtomicUsize::new(0) })
    }

    /// Returns (creating if absent) the calling thread's cache, sticky to
    /// one arena for the thread's whole lifetime: round-robin across arenas
    /// at first touch, then pinned, so repeated allocations from the same
    /// thread keep hitting the same arena's bands instead of spreading load
    /// thin across all of them.
    fn thread_cache(&self) -> Rc<ThreadCache> {
        THREAD_CACHES.with(|caches| {
            caches
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| {
                    let idx = self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
                    Rc::new(ThreadCache::new(Arc::clone(&self.arenas[idx])))
                })
                .clone()
        })
    }

    pub fn allocate(&self, capacity: usize) -> Result<ByteBuf> {
        let tc = self.thread_cache();
        let arena = Arc::clone(tc.arena());
        let allocation = tc.allocate(capacity)?;
        Ok(ByteBuf {
            allocator_id: self.id,
            arena,
            chunk: allocation.chunk,
            handle: allocation.handle,
            handle_capacity: allocation.normalized_size,
            length: capacity.min(allocation.normalized_size),
        })
    }

    pub fn stats(&self) -> AllocatorStats {
        let arenas: Vec<ArenaStats> = self.arenas.iter().map(|a| a.stats()).collect();
        let total_allocated = arenas.iter().map(|s| s.allocated_bytes).sum();
        let total_unpooled = arenas.iter().map(|s| s.unpooled_bytes).sum();
        let total_chunks = arenas.iter().map(|s| s.chunk_count).sum();
        AllocatorStats { arenas, total_allocated_bytes: total_allocated, total_unpooled_bytes: total_unpooled, total_chunk_count: total_chunks }
    }
}

/// A contiguous off-heap byte range, analogous to Netty's pooled `ByteBuf`:
/// an owning handle into some chunk, freed through the same arena (and,
/// where possible, the same thread's cache) that minted it.
///
/// `Send + Sync`: every field is itself `Send + Sync` (atomics and
/// `parking_lot` locks inside `Arena`/`Chunk`), so a `ByteBuf` can live
/// inside a value entry shared across threads by the concurrent map. It is
/// still "not thread-safe" in the sense that concurrent writers must
/// coordinate through that outer structure — nothing here serializes two
/// overlapping `write` calls.
pub struct ByteBuf {
    allocator_id: usize,
    arena: Arc<Arena>,
    chunk: Arc<Chunk>,
    handle: Handle,
    handle_capacity: usize,
    length: usize,
}

impl ByteBuf {
    /// Logical length in use, always `<= capacity()`.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Total bytes reserved for this handle (the normalized size), which may
    /// exceed `len()`.
    pub fn capacity(&self) -> usize {
        self.handle_capacity
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(CacheError::CapacityExceeded { attempted: usize::MAX, capacity: self.handle_capacity })?;
        if end > self.handle_capacity {
            return Err(CacheError::CapacityExceeded { attempted: end, capacity: self.handle_capacity });
        }
        let base = self.chunk.offset_of(self.handle);
        self.chunk.region().copy_in(base + offset, data);
        self.length = self.length.max(end);
        Ok(())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(dst.len()).ok_or(CacheError::CapacityExceeded { attempted: usize::MAX, capacity: self.length })?;
        if end > self.length {
            return Err(CacheError::CapacityExceeded { attempted: end, capacity: self.length });
        }
        let base = self.chunk.offset_of(self.handle);
        self.chunk.region().copy_out(base + offset, dst);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.length];
        let base = self.chunk.offset_of(self.handle);
        self.chunk.region().copy_out(base, &mut out);
        out
    }

    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.handle_capacity {
            return Err(CacheError::CapacityExceeded { attempted: len, capacity: self.handle_capacity });
        }
        self.length = len;
        Ok(())
    }
}

impl Drop for ByteBuf {
    fn drop(&mut self) {
        let routed = THREAD_CACHES.with(|caches| {
            if let Some(tc) = caches.borrow().get(&self.allocator_id) {
                if Arc::ptr_eq(tc.arena(), &self.arena) {
                    tc.free(Arc::clone(&self.chunk), self.handle, self.handle_capacity);
                    return true;
                }
            }
            false
        });
        if !routed {
            self.arena.free(&self.chunk, self.handle, self.handle_capacity);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AllocatorStats {
    pub arenas: Vec<ArenaStats>,
    pub total_allocated_bytes: usize,
    pub total_unpooled_bytes: usize,
    pub total_chunk_count: usize,
}
