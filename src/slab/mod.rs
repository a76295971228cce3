//! Slab allocator implementation.
//!
//! A [`SlabCache`] hands out fixed-size objects carved from backing blocks.
//! Each cpu allocates from its own frozen slab without locking; slow paths
//! fall back to per-cpu partial slabs, then to per-node partial pools, and
//! finally to a fresh block. Caches are created and merged through a
//! [`SlabRegistry`].

use core::ptr::NonNull;

// Per-cpu event counters; expand to nothing without the `stats` feature.
#[cfg(feature = "stats")]
macro_rules! stat {
    ($cpu:expr, $item:ident) => {
        $cpu.stat($crate::slab::stats::StatItem::$item)
    };
}
#[cfg(not(feature = "stats"))]
macro_rules! stat {
    ($cpu:expr, $item:ident) => {{
        let _ = &$cpu;
    }};
}

mod cpu_slab;
mod directory;
mod flags;
mod hardening;
mod layout;
mod node_partial;
pub mod order;
mod registry;
mod slab_cache;
mod slab_node;
mod stats;

pub use flags::SlabFlags;
pub use layout::{ObjectLayout, ARCH_SLAB_MINALIGN, RED_INACTIVE};
pub use order::{OrderObjects, DEFAULT_MAX_ORDER, MAX_OBJS_PER_PAGE, MAX_ORDER};
pub use registry::SlabRegistry;
pub use slab_cache::SlabCache;
pub use stats::CacheInfo;
#[cfg(feature = "stats")]
pub use stats::{SlabStats, StatItem};

/// Object constructor, run once per object when its slab is carved.
///
/// A constructor must not allocate from or free to the cache it belongs to.
pub type Constructor = fn(NonNull<u8>);
