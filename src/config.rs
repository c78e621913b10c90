//! Construction-time configuration for the allocator and the cache.
//!
//! Mirrors the teacher's `BufferPoolConfig`-with-`Default` shape: plain data,
//! a `Default` impl with sane production values, and a `validate()` that
//! turns bad input into a [`CacheError::ConfigError`] instead of panicking.

use crate::error::{CacheError, Result};

/// Netty's pooled-allocator page size: 8 KiB.
pub const PAGE_SIZE: usize = 8192;
/// Netty's pooled-allocator tree depth: 11 levels below the chunk root.
pub const MAX_ORDER: usize = 11;
/// `pageSize << maxOrder` = 16 MiB per chunk.
pub const CHUNK_SIZE: usize = PAGE_SIZE << MAX_ORDER;

/// Largest concurrency (segment count) the map will honor.
pub const MAX_CONCURRENCY: usize = 1 << 16;

/// Configuration for the [`crate::memory::allocator::Allocator`] facade.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Total off-heap budget, in bytes, spread across all arenas.
    pub max_memory_size: usize,
    /// Number of arenas. `None` defaults to 2x the visible CPU count.
    pub arena_count: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_memory_size: 256 * 1024 * 1024,
            arena_count: None,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_size < CHUNK_SIZE {
            return Err(CacheError::ConfigError(format!(
                "max_memory_size must be at least one chunk ({CHUNK_SIZE} bytes), got {}",
                self.max_memory_size
            )));
        }
        if let Some(count) = self.arena_count {
            if count == 0 {
                return Err(CacheError::ConfigError("arena_count must be >= 1".into()));
            }
        }
        Ok(())
    }

    /// Resolved arena count: the configured value, or 2x CPU count clamped to >= 1.
    pub fn resolved_arena_count(&self) -> usize {
        self.arena_count
            .unwrap_or_else(|| (num_cpus::get() * 2).max(1))
    }

    /// Per-arena chunk budget in bytes, i.e. how many chunks an arena may
    /// create before `allocate` starts failing with `AllocationFailure`.
    pub fn per_arena_budget(&self) -> usize {
        let arenas = self.resolved_arena_count();
        (self.max_memory_size + arenas - 1) / arenas
    }
}

/// Eviction strategy selector. The strategy itself lives above the core
/// (it only consumes [`crate::map::ConcurrentMap::evict_candidates`]); this
/// enum exists so callers can express the choice through `CacheConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Lru,
    None,
}

/// Configuration for the [`crate::map::ConcurrentMap`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Segment count, rounded up to a power of two and capped at
    /// [`MAX_CONCURRENCY`].
    pub concurrency: usize,
    /// Total bucket count across all segments (divided evenly per segment).
    pub initial_capacity: usize,
    /// Per-segment rehash threshold as a fraction of bucket count.
    pub load_factor: f64,
    /// Eviction strategy hint for the layer above the core.
    pub eviction_policy: EvictionPolicy,
    /// Soft cap on live entries. `None` means unbounded (the facade never
    /// evicts on its own; callers manage size themselves).
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            initial_capacity: 256,
            load_factor: 0.75,
            eviction_policy: EvictionPolicy::Lru,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CacheError::ConfigError("concurrency must be >= 1".into()));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(CacheError::ConfigError(format!(
                "concurrency must be <= {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor.is_finite()) {
            return Err(CacheError::ConfigError(format!(
                "load_factor must be a positive finite number, got {}",
                self.load_factor
            )));
        }
        if self.max_entries == Some(0) {
            return Err(CacheError::ConfigError("max_entries must be >= 1 when set".into()));
        }
        Ok(())
    }

    /// Segment count: smallest power of two >= `concurrency`, capped.
    pub fn segment_count(&self) -> usize {
        self.concurrency.max(1).next_power_of_two().min(MAX_CONCURRENCY)
    }
}
