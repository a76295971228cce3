//! Backing block allocator interface.
//!
//! Slabs are carved from power-of-two blocks of pages handed out by a
//! [`BlockAllocator`]. [`HeapBlockAllocator`] serves those blocks from the
//! `alloc` global heap and can be capped to emulate memory pressure.

use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{AllocError, AllocResult, NodeId};

bitflags! {
    /// Allocation modifiers passed down to the backing allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfpFlags: u32 {
        /// Do not log a failure; the caller has a fallback.
        const NOWARN = 1 << 0;
        /// Fail fast instead of trying hard to satisfy the request.
        const NORETRY = 1 << 1;
        /// Return zeroed memory.
        const ZERO = 1 << 2;
        /// Only use memory suitable for DMA.
        const DMA = 1 << 3;
        /// Never fall back to another node.
        const THISNODE = 1 << 4;
    }
}

/// Page-granularity allocator backing the slab caches.
///
/// Blocks must be naturally aligned: a block of `order` starts at a multiple
/// of `PAGE_SIZE << order`. Slab lookup relies on this.
pub trait BlockAllocator: Send + Sync {
    /// The size of a memory page.
    const PAGE_SIZE: usize;

    /// Allocate `1 << order` contiguous pages, preferably on `node`.
    fn alloc_block(&self, order: u32, node: NodeId, flags: GfpFlags) -> AllocResult<usize>;

    /// Return a block previously obtained from [`alloc_block`](Self::alloc_block).
    fn free_block(&self, addr: usize, order: u32);
}

/// Block allocator on top of the global heap.
pub struct HeapBlockAllocator<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    /// Largest order this allocator will serve.
    max_order: AtomicU32,
    /// Page budget, `usize::MAX` when unlimited.
    page_limit: AtomicUsize,
    used_pages: AtomicUsize,
    live_blocks: AtomicUsize,
    total_allocations: AtomicUsize,
    total_failures: AtomicUsize,
}

impl<const PAGE_SIZE: usize> HeapBlockAllocator<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            max_order: AtomicU32::new(crate::slab::MAX_ORDER - 1),
            page_limit: AtomicUsize::new(usize::MAX),
            used_pages: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_failures: AtomicUsize::new(0),
        }
    }

    /// Refuse blocks larger than `order`.
    pub fn with_max_order(self, order: u32) -> Self {
        self.max_order.store(order, Ordering::Relaxed);
        self
    }

    /// Refuse allocations once `pages` pages are outstanding.
    pub fn with_page_limit(self, pages: usize) -> Self {
        self.page_limit.store(pages, Ordering::Relaxed);
        self
    }

    pub fn set_max_order(&self, order: u32) {
        self.max_order.store(order, Ordering::Relaxed);
    }

    pub fn set_page_limit(&self, pages: usize) {
        self.page_limit.store(pages, Ordering::Relaxed);
    }

    /// Pages currently handed out.
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    /// Blocks currently handed out.
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> usize {
        self.total_failures.load(Ordering::Relaxed)
    }

    fn block_layout(order: u32) -> AllocResult<Layout> {
        let bytes = PAGE_SIZE
            .checked_shl(order)
            .ok_or(AllocError::InvalidParam)?;
        Layout::from_size_align(bytes, bytes).map_err(|_| AllocError::InvalidParam)
    }

    fn fail(&self, order: u32, flags: GfpFlags) -> AllocResult<usize> {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if !flags.contains(GfpFlags::NOWARN) {
            warn!(
                "block allocator: order {} allocation failed ({} of {} pages used)",
                order,
                self.used_pages(),
                self.page_limit.load(Ordering::Relaxed)
            );
        }
        Err(AllocError::NoMemory)
    }
}

impl<const PAGE_SIZE: usize> BlockAllocator for HeapBlockAllocator<PAGE_SIZE> {
    const PAGE_SIZE: usize = PAGE_SIZE;

    fn alloc_block(&self, order: u32, _node: NodeId, flags: GfpFlags) -> AllocResult<usize> {
        if order > self.max_order.load(Ordering::Relaxed) {
            return self.fail(order, flags);
        }
        let layout = Self::block_layout(order)?;
        let pages = 1usize << order;
        let limit = self.page_limit.load(Ordering::Relaxed);

        // Reserve the pages first so concurrent callers cannot overshoot the budget
        if self
            .used_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(pages).filter(|&total| total <= limit)
            })
            .is_err()
        {
            return self.fail(order, flags);
        }

        let ptr = unsafe {
            if flags.contains(GfpFlags::ZERO) {
                alloc::alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc::alloc(layout)
            }
        };
        if ptr.is_null() {
            self.used_pages.fetch_sub(pages, Ordering::AcqRel);
            return self.fail(order, flags);
        }

        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        debug!("block allocator: order {} block at {:#x}", order, ptr as usize);
        Ok(ptr as usize)
    }

    fn free_block(&self, addr: usize, order: u32) {
        let Ok(layout) = Self::block_layout(order) else {
            return;
        };
        unsafe { alloc::alloc::dealloc(addr as *mut u8, layout) };
        self.used_pages.fetch_sub(1usize << order, Ordering::AcqRel);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<const PAGE_SIZE: usize> Default for HeapBlockAllocator<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_naturally_aligned() {
        let blocks = HeapBlockAllocator::<4096>::new();
        for order in 0..4 {
            let addr = blocks.alloc_block(order, 0, GfpFlags::empty()).unwrap();
            assert!(crate::is_aligned(addr, 4096 << order));
            blocks.free_block(addr, order);
        }
        assert_eq!(blocks.live_blocks(), 0);
        assert_eq!(blocks.used_pages(), 0);
    }

    #[test]
    fn test_page_limit() {
        let blocks = HeapBlockAllocator::<4096>::new().with_page_limit(3);
        let a = blocks.alloc_block(1, 0, GfpFlags::empty()).unwrap();
        assert_eq!(
            blocks.alloc_block(1, 0, GfpFlags::NOWARN),
            Err(AllocError::NoMemory)
        );
        let b = blocks.alloc_block(0, 0, GfpFlags::empty()).unwrap();
        assert_eq!(blocks.used_pages(), 3);
        blocks.free_block(a, 1);
        blocks.free_block(b, 0);
        assert_eq!(blocks.used_pages(), 0);
        assert_eq!(blocks.total_failures(), 1);
    }

    #[test]
    fn test_max_order() {
        let blocks = HeapBlockAllocator::<4096>::new().with_max_order(1);
        assert!(blocks.alloc_block(2, 0, GfpFlags::NOWARN).is_err());
        let addr = blocks.alloc_block(1, 0, GfpFlags::ZERO).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
        blocks.free_block(addr, 1);
    }
}
