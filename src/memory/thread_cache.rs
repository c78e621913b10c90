//! Per-thread, per-size-class free lists sitting in front of an [`Arena`],
//! so the common case of "free one small buffer, allocate another the same
//! size a moment later" never touches the arena's bands or subpage pools.
//! Bounded with `crossbeam::queue::ArrayQueue`, the same lock-free bounded
//! queue the teacher reaches for in its thread-local free-list code.

use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

use super::arena::{Allocation, Arena};
use super::chunk::{Chunk, Handle};

/// Capacity of each per-size-class queue. Small enough that a thread cache
/// never hoards more than a few hundred KiB of otherwise-reclaimable memory.
const QUEUE_CAPACITY: usize = 64;

struct CachedItem {
    chunk: Arc<Chunk>,
    handle: Handle,
    normalized_size: usize,
}

pub struct ThreadCache {
    arena: Arc<Arena>,
    queues: Vec<ArrayQueue<CachedItem>>,
}

impl ThreadCache {
    pub fn new(arena: Arc<Arena>) -> Self {
        let queues = (0..arena.size_class_count()).map(|_| ArrayQueue::new(QUEUE_CAPACITY)).collect();
        Self { arena, queues }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn allocate(&self, requested: usize) -> Result<Allocation> {
        let norm = self.arena.normalize(requested);
        if let Some(idx) = self.arena.size_class_index(norm) {
            if let Some(item) = self.queues[idx].pop() {
                return Ok(Allocation { chunk: item.chunk, handle: item.handle, normalized_size: item.normalized_size });
            }
        }
        self.arena.allocate(requested)
    }

    pub fn free(&self, chunk: Arc<Chunk>, handle: Handle, normalized_size: usize) {
        if let Some(idx) = self.arena.size_class_index(normalized_size) {
            let item = CachedItem { chunk, handle, normalized_size };
            if let Err(item) = self.queues[idx].push(item) {
                self.arena.free(&item.chunk, item.handle, item.normalized_size);
            }
            return;
        }
        self.arena.free(&chunk, handle, normalized_size);
    }

    /// Drains every queued item back to the arena. Called on thread exit via
    /// `Drop`, and exposed for callers that want to shrink memory use eagerly
    /// (e.g. after a burst of short-lived allocations on a worker thread).
    pub fn trim(&self) {
        let mut drained = 0usize;
        for queue in &self.queues {
            while let Some(item) = queue.pop() {
                self.arena.free(&item.chunk, item.handle, item.normalized_size);
                drained += 1;
            }
        }
        if drained > 0 {
            debug!(drained, "thread cache trim swept queued items back to arena");
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.trim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;

    fn test_cache() -> ThreadCache {
        let cfg = AllocatorConfig { max_memory_size: 64 * 1024, arena_count: Some(1) };
        ThreadCache::new(Arc::new(Arena::new(&cfg, 64, 4, 1024)))
    }

    #[test]
    fn freed_small_allocation_is_reused_without_new_subpage() {
        let tc = test_cache();
        let a = tc.allocate(16).unwrap();
        let chunk_ptr = Arc::as_ptr(&a.chunk);
        tc.free(Arc::clone(&a.chunk), a.handle, a.normalized_size);

        let before = tc.arena().stats();
        let b = tc.allocate(16).unwrap();
        let after = tc.arena().stats();

        assert_eq!(Arc::as_ptr(&b.chunk), chunk_ptr);
        assert_eq!(before.allocated_bytes, after.allocated_bytes, "reuse from thread cache shouldn't touch arena accounting twice");
        tc.free(b.chunk, b.handle, b.normalized_size);
    }

    #[test]
    fn trim_returns_cached_items_to_arena() {
        let tc = test_cache();
        let a = tc.allocate(16).unwrap();
        tc.free(a.chunk, a.handle, a.normalized_size);
        assert!(tc.arena().stats().allocated_bytes > 0);
        tc.trim();
        assert_eq!(tc.arena().stats().allocated_bytes, 0);
    }

    #[test]
    fn large_allocations_bypass_the_cache() {
        let tc = test_cache();
        let a = tc.allocate(1024).unwrap();
        tc.free(a.chunk, a.handle, a.normalized_size);
        assert_eq!(tc.arena().stats().allocated_bytes, 0);
    }
}
