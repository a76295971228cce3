//! Block address to slab lookup.
//!
//! Slow-path frees have to find the slab that owns an object. Blocks are
//! naturally aligned, so the owning block base is `align_down(addr, block
//! bytes)` for the block's order; the directory probes each order the cache
//! may have used. Entries are sharded so concurrent frees rarely contend.

use alloc::collections::BTreeMap;
use core::ops::RangeInclusive;

use kspin::SpinNoIrq;

use super::slab_node::Slab;
use crate::align_down;

const DIRECTORY_SHARDS: usize = 16;

struct Shard(BTreeMap<usize, Slab>);

// SAFETY: entries are plain handles; the headers they point to are
// synchronized by node locks.
unsafe impl Send for Shard {}

pub(crate) struct SlabDirectory {
    page_size: usize,
    shards: [SpinNoIrq<Shard>; DIRECTORY_SHARDS],
}

impl SlabDirectory {
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            shards: [const { SpinNoIrq::new(Shard(BTreeMap::new())) }; DIRECTORY_SHARDS],
        }
    }

    fn shard(&self, base: usize) -> &SpinNoIrq<Shard> {
        let page = base / self.page_size;
        &self.shards[page % DIRECTORY_SHARDS]
    }

    pub fn insert(&self, slab: Slab) {
        self.shard(slab.base()).lock().0.insert(slab.base(), slab);
    }

    pub fn remove(&self, slab: Slab) {
        self.shard(slab.base()).lock().0.remove(&slab.base());
    }

    /// Find the slab whose block contains `addr`.
    pub fn lookup(&self, addr: usize, orders: RangeInclusive<u32>) -> Option<Slab> {
        for order in orders {
            let base = align_down(addr, self.page_size << order);
            let found = self.shard(base).lock().0.get(&base).copied();
            if let Some(slab) = found {
                if slab.order() == order && slab.contains(addr) {
                    return Some(slab);
                }
            }
        }
        None
    }

    /// Remove and return every registered slab.
    pub fn drain(&self) -> alloc::vec::Vec<Slab> {
        let mut slabs = alloc::vec::Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            slabs.extend(core::mem::take(&mut shard.0).into_values());
        }
        slabs
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().0.len()).sum()
    }
}
