//! Error taxonomy for the native cache.
//!
//! Four categories, matching the failure modes the core can actually raise;
//! invalid-handle/double-free and disposed-buffer access are deliberately
//! not variants here (see [`crate::memory::chunk`]) because `ByteBuf`
//! ownership (and the `Arc` wrapping it in [`crate::entry::ValueEntry`])
//! makes both unreachable — there is no code path that hands a caller a
//! handle into memory that has already been freed.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// An arena could not satisfy an allocation without exceeding its
    /// configured memory budget.
    #[error("allocation failed: {requested} bytes requested, arena budget exhausted ({reason})")]
    AllocationFailure { requested: usize, reason: String },

    /// `write` was called with more bytes than the target buffer's capacity.
    #[error("capacity exceeded: tried to write {attempted} bytes into a buffer of capacity {capacity}")]
    CapacityExceeded { attempted: usize, capacity: usize },

    /// Construction-time validation failure: non-positive load factor,
    /// zero capacity, concurrency out of the supported range, etc.
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
