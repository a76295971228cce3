//! Per-cache creation flags.

use bitflags::bitflags;

bitflags! {
    /// Strategies attached to a cache when it is created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SlabFlags: u32 {
        /// Align objects on cache lines.
        const HWCACHE_ALIGN = 1 << 0;
        /// Guard every object with left and right red zones.
        const RED_ZONE = 1 << 1;
        /// Check frees against the whole slab freelist.
        const CONSISTENCY_CHECKS = 1 << 2;
        /// Obfuscate freelist pointers with a per-cache secret.
        const FREELIST_HARDENED = 1 << 3;
        /// Link freshly carved objects in a random order.
        const FREELIST_RANDOM = 1 << 4;
        /// Keep frozen partial slabs on each cpu.
        const CPU_PARTIAL = 1 << 5;
        /// Back slabs with DMA-capable memory.
        const CACHE_DMA = 1 << 6;
        /// Never share this cache with a compatible one.
        const NO_MERGE = 1 << 7;
    }
}

impl SlabFlags {
    /// Flags that prevent a cache from being merged with another.
    pub const NEVER_MERGE: Self = Self::RED_ZONE
        .union(Self::CONSISTENCY_CHECKS)
        .union(Self::NO_MERGE);

    /// Flags that must agree for two caches to be merged.
    pub const MERGE_SAME: Self = Self::CACHE_DMA
        .union(Self::CPU_PARTIAL)
        .union(Self::FREELIST_HARDENED)
        .union(Self::FREELIST_RANDOM);

    /// Flags that turn on object debugging.
    pub const DEBUG_FLAGS: Self = Self::RED_ZONE.union(Self::CONSISTENCY_CHECKS);
}
