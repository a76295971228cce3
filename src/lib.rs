//! SLUB-style slab allocator
//!
//! This crate implements a per-object slab allocator on top of a
//! page-granularity backing allocator, featuring:
//! - Lock-free per-cpu fast paths guarded by a transaction id
//! - Per-node partial slab pools with min_partial trimming
//! - Optional per-cpu frozen partial lists
//! - Order packing with fallback to smaller orders
//! - Optional freelist hardening, freelist randomization and red zones

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for backing blocks
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Index of a cpu slot inside a cache.
pub type CpuId = usize;

/// Index of a locality domain (NUMA node).
pub type NodeId = usize;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid size, alignment, cpu id or node id.
    InvalidParam,
    /// The backing allocator is exhausted at every fallback order.
    NoMemory,
    /// The cache still has live objects.
    InUse,
    /// A red zone or freelist pointer was found damaged.
    Corrupted,
    /// The pointer does not belong to any slab of the cache.
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
#[allow(dead_code)]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod block_allocator;
pub use block_allocator::{BlockAllocator, GfpFlags, HeapBlockAllocator};

pub mod config;
pub use config::SlabConfig;

pub mod slab;
#[cfg(feature = "stats")]
pub use slab::{SlabStats, StatItem};
pub use slab::{
    CacheInfo, Constructor, ObjectLayout, OrderObjects, SlabCache, SlabFlags, SlabRegistry,
};
