//! Slab statistics.
//!
//! Event counters are kept per cpu and only compiled with the `stats`
//! feature. [`CacheInfo`] is a slabinfo-style snapshot that is always
//! available.

use alloc::string::String;
use alloc::vec::Vec;

/// Slab allocator events.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum StatItem {
    /// Allocation from cpu slab
    AllocFastpath,
    /// Allocation by getting a new cpu slab
    AllocSlowpath,
    /// Free to cpu slab
    FreeFastpath,
    /// Freeing not to cpu slab
    FreeSlowpath,
    /// Freeing to frozen slab
    FreeFrozen,
    /// Freeing moves slab to partial list
    FreeAddPartial,
    /// Freeing removes last object
    FreeRemovePartial,
    /// Cpu slab acquired from node partial list
    AllocFromPartial,
    /// Cpu slab acquired from the backing allocator
    AllocSlab,
    /// Refill cpu slab from slab freelist
    AllocRefill,
    /// Switching cpu slab
    AllocNodeMismatch,
    /// Slab freed to the backing allocator
    FreeSlab,
    /// Abandoning of the cpu slab
    CpuslabFlush,
    /// Cpu slab was full when deactivated
    DeactivateFull,
    /// Cpu slab was empty when deactivated
    DeactivateEmpty,
    /// Cpu slab was moved to the head of partials
    DeactivateToHead,
    /// Cpu slab was moved to the tail of partials
    DeactivateToTail,
    /// Slab contained remotely freed objects
    DeactivateRemoteFrees,
    /// Implicit deactivation
    DeactivateBypass,
    /// Number of times fallback was necessary
    OrderFallback,
    /// Failure of the per-cpu compare-and-swap
    CmpxchgDoubleCpuFail,
    /// Used cpu partial on alloc
    CpuPartialAlloc,
    /// Refill cpu partial on free
    CpuPartialFree,
    /// Refill cpu partial from node partial
    CpuPartialNode,
    /// Drain cpu partial to node partial
    CpuPartialDrain,
}

#[cfg(feature = "stats")]
impl StatItem {
    pub const COUNT: usize = 25;

    pub const ALL: [StatItem; Self::COUNT] = [
        StatItem::AllocFastpath,
        StatItem::AllocSlowpath,
        StatItem::FreeFastpath,
        StatItem::FreeSlowpath,
        StatItem::FreeFrozen,
        StatItem::FreeAddPartial,
        StatItem::FreeRemovePartial,
        StatItem::AllocFromPartial,
        StatItem::AllocSlab,
        StatItem::AllocRefill,
        StatItem::AllocNodeMismatch,
        StatItem::FreeSlab,
        StatItem::CpuslabFlush,
        StatItem::DeactivateFull,
        StatItem::DeactivateEmpty,
        StatItem::DeactivateToHead,
        StatItem::DeactivateToTail,
        StatItem::DeactivateRemoteFrees,
        StatItem::DeactivateBypass,
        StatItem::OrderFallback,
        StatItem::CmpxchgDoubleCpuFail,
        StatItem::CpuPartialAlloc,
        StatItem::CpuPartialFree,
        StatItem::CpuPartialNode,
        StatItem::CpuPartialDrain,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatItem::AllocFastpath => "alloc_fastpath",
            StatItem::AllocSlowpath => "alloc_slowpath",
            StatItem::FreeFastpath => "free_fastpath",
            StatItem::FreeSlowpath => "free_slowpath",
            StatItem::FreeFrozen => "free_frozen",
            StatItem::FreeAddPartial => "free_add_partial",
            StatItem::FreeRemovePartial => "free_remove_partial",
            StatItem::AllocFromPartial => "alloc_from_partial",
            StatItem::AllocSlab => "alloc_slab",
            StatItem::AllocRefill => "alloc_refill",
            StatItem::AllocNodeMismatch => "alloc_node_mismatch",
            StatItem::FreeSlab => "free_slab",
            StatItem::CpuslabFlush => "cpuslab_flush",
            StatItem::DeactivateFull => "deactivate_full",
            StatItem::DeactivateEmpty => "deactivate_empty",
            StatItem::DeactivateToHead => "deactivate_to_head",
            StatItem::DeactivateToTail => "deactivate_to_tail",
            StatItem::DeactivateRemoteFrees => "deactivate_remote_frees",
            StatItem::DeactivateBypass => "deactivate_bypass",
            StatItem::OrderFallback => "order_fallback",
            StatItem::CmpxchgDoubleCpuFail => "cmpxchg_double_cpu_fail",
            StatItem::CpuPartialAlloc => "cpu_partial_alloc",
            StatItem::CpuPartialFree => "cpu_partial_free",
            StatItem::CpuPartialNode => "cpu_partial_node",
            StatItem::CpuPartialDrain => "cpu_partial_drain",
        }
    }
}

/// Counters summed over every cpu of a cache.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    counters: [u64; StatItem::COUNT],
}

#[cfg(feature = "stats")]
impl SlabStats {
    pub const fn new() -> Self {
        Self {
            counters: [0; StatItem::COUNT],
        }
    }

    pub(crate) fn add(&mut self, item: StatItem, count: u64) {
        self.counters[item as usize] += count;
    }

    pub fn get(&self, item: StatItem) -> u64 {
        self.counters[item as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatItem, u64)> + '_ {
        StatItem::ALL.iter().map(|&item| (item, self.get(item)))
    }
}

#[cfg(feature = "stats")]
impl Default for SlabStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "stats")]
impl core::ops::Index<StatItem> for SlabStats {
    type Output = u64;

    fn index(&self, item: StatItem) -> &u64 {
        &self.counters[item as usize]
    }
}

/// Snapshot of a cache's shape and occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub name: String,
    pub object_size: usize,
    pub size: usize,
    pub align: usize,
    pub order: u32,
    pub objects_per_slab: usize,
    pub min_partial: usize,
    pub cpu_partial: usize,
    pub refcount: usize,
    /// Slabs attributed to each node, whatever their state.
    pub nr_slabs: usize,
    pub total_objects: usize,
    /// Length of each node partial list.
    pub node_partial: Vec<usize>,
}

impl CacheInfo {
    pub fn nr_partial(&self) -> usize {
        self.node_partial.iter().sum()
    }
}
