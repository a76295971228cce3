//! Per-cpu slab slot.
//!
//! The fast path works on a single `AtomicU64` holding the transaction id
//! and the index of the first free object of the current slab. Every update
//! bumps the tid, so a compare-and-swap against a stale snapshot fails even
//! when the freelist head happens to be the same again.

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use kspin::SpinNoIrq;

use super::slab_node::{Slab, SlabHeader};
#[cfg(feature = "stats")]
use super::stats::StatItem;

const FREELIST_BITS: u32 = 16;
const FREELIST_MASK: u64 = (1 << FREELIST_BITS) - 1;
const FREELIST_NONE: u64 = FREELIST_MASK;

/// Packed `(tid, freelist index)` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TidFreelist(u64);

impl TidFreelist {
    pub const fn new(tid: u64, freelist: Option<usize>) -> Self {
        let index = match freelist {
            Some(index) => index as u64,
            None => FREELIST_NONE,
        };
        Self((tid << FREELIST_BITS) | index)
    }

    pub const fn tid(self) -> u64 {
        self.0 >> FREELIST_BITS
    }

    pub const fn freelist(self) -> Option<usize> {
        match self.0 & FREELIST_MASK {
            FREELIST_NONE => None,
            index => Some(index as usize),
        }
    }

    /// Same slot, next transaction.
    pub const fn advance(self, freelist: Option<usize>) -> Self {
        Self::new(self.tid().wrapping_add(1), freelist)
    }
}

/// Frozen partial slabs reserved by one cpu.
pub(crate) struct CpuPartial {
    /// Slabs with their free object count at the time they were added.
    pub slabs: Vec<(Slab, usize)>,
    /// Sum of the free counts in `slabs`.
    pub pobjects: usize,
}

impl CpuPartial {
    pub fn push(&mut self, slab: Slab, free: usize) {
        self.slabs.push((slab, free));
        self.pobjects += free;
    }

    /// Take the most recently added slab that satisfies `accept`.
    pub fn take(&mut self, accept: impl Fn(Slab) -> bool) -> Option<Slab> {
        let pos = self.slabs.iter().rposition(|&(slab, _)| accept(slab))?;
        let (slab, free) = self.slabs.remove(pos);
        self.pobjects = self.pobjects.saturating_sub(free);
        Some(slab)
    }
}

pub(crate) struct CpuSlab {
    state: AtomicU64,
    slab: AtomicPtr<SlabHeader>,
    /// Serializes this cpu's slow paths and guards its partial list.
    partial: SpinNoIrq<CpuPartial>,
    #[cfg(feature = "stats")]
    stats: [AtomicU64; StatItem::COUNT],
}

// SAFETY: slabs reachable from the slot are frozen to it; their shared
// state is only touched under node locks.
unsafe impl Send for CpuSlab {}
unsafe impl Sync for CpuSlab {}

impl CpuSlab {
    pub fn new(cpu: usize) -> Self {
        Self {
            // Give each cpu a distinct tid range.
            state: AtomicU64::new(TidFreelist::new(cpu as u64, None).0),
            slab: AtomicPtr::new(ptr::null_mut()),
            partial: SpinNoIrq::new(CpuPartial {
                slabs: Vec::new(),
                pobjects: 0,
            }),
            #[cfg(feature = "stats")]
            stats: [const { AtomicU64::new(0) }; StatItem::COUNT],
        }
    }

    #[inline]
    pub fn load(&self) -> TidFreelist {
        TidFreelist(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn current(&self) -> Option<Slab> {
        Slab::from_ptr(self.slab.load(Ordering::Acquire))
    }

    /// Publish `next` if the slot still holds `expected`.
    #[inline]
    pub fn try_update(&self, expected: TidFreelist, next: TidFreelist) -> bool {
        self.state
            .compare_exchange(expected.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Empty the freelist and return what it held. Any fast path racing with
    /// this fails its compare-and-swap.
    pub fn take_freelist(&self) -> Option<usize> {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(TidFreelist(raw).advance(None).0)
            })
            .unwrap_or_else(|raw| raw);
        TidFreelist(prev).freelist()
    }

    /// Detach the current slab; the freelist must already be taken.
    pub fn take_slab(&self) -> Option<Slab> {
        Slab::from_ptr(self.slab.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Make `slab` the current slab with `freelist` as its private freelist.
    pub fn install(&self, slab: Slab, freelist: Option<usize>) {
        self.take_freelist();
        self.slab.store(slab.as_ptr(), Ordering::Release);
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(TidFreelist(raw).advance(freelist).0)
            });
    }

    pub fn lock_partial(&self) -> kspin::SpinNoIrqGuard<'_, CpuPartial> {
        self.partial.lock()
    }

    #[cfg(feature = "stats")]
    #[inline]
    pub fn stat(&self, item: StatItem) {
        self.stats[item as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "stats")]
    pub fn stat_count(&self, item: StatItem) -> u64 {
        self.stats[item as usize].load(Ordering::Relaxed)
    }
}
