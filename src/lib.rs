//! An in-process key-value cache backed by off-heap native memory: values
//! live outside the Rust heap in a buddy-allocated pool modeled on Netty's
//! `PooledByteBufAllocator`, keyed by a striped concurrent map modeled on
//! `java.util.concurrent.ConcurrentHashMap`.
//!
//! [`facade::NativeCache`] is the entry point most callers want. The
//! allocator ([`memory`]) and map ([`map`], [`segment`], [`entry`],
//! [`lru`]) are independently usable for callers who only need one half.

pub mod config;
pub mod entry;
pub mod error;
pub mod facade;
pub mod lru;
pub mod map;
pub mod memory;
pub mod segment;
pub mod telemetry;

pub use config::{AllocatorConfig, CacheConfig, EvictionPolicy};
pub use error::{CacheError, Result};
pub use facade::{CacheSnapshot, NativeCache};
pub use memory::{Allocator, AllocatorStats, ByteBuf};
