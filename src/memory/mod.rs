//! Off-heap byte storage: a Netty-style pooled allocator built from six
//! layers, each its own module, each independently testable:
//!
//! - [`region`] — raw native memory, acquired via `std::alloc`.
//! - [`subpage`] — bitmap-tracked sub-page-sized elements.
//! - [`chunk`] — one 16 MiB buddy tree of pages.
//! - [`arena`] — a chunk's utilization bands and size-class free lists.
//! - [`thread_cache`] — per-thread free lists sitting in front of an arena.
//! - [`allocator`] — the public facade: [`allocator::Allocator`] and
//!   [`allocator::ByteBuf`].

pub mod allocator;
pub mod arena;
pub mod chunk;
pub mod region;
pub mod subpage;
pub mod thread_cache;

pub use allocator::{Allocator, AllocatorStats, ByteBuf};
pub use arena::ArenaStats;
