//! Slab node implementation.
//!
//! A slab is one backing block carved into equal-size objects. Its
//! metadata lives out of band in a heap-allocated [`SlabHeader`], so the
//! whole block is available for objects.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use super::layout::ObjectLayout;
use crate::NodeId;

/// Mutable slab state, only touched under the owning node's lock.
pub(crate) struct SlabState {
    /// Head object of the slab's own freelist, 0 when empty.
    pub freelist: usize,
    /// Objects not on `freelist`.
    pub inuse: u16,
    /// Set once objects were lost to a damaged freelist. They stay counted
    /// in `inuse`, so the slab never becomes empty again.
    pub corrupted: bool,
    pub prev: Option<Slab>,
    pub next: Option<Slab>,
}

pub(crate) struct SlabHeader {
    base: usize,
    bytes: usize,
    order: u32,
    objects: u16,
    node: NodeId,
    frozen: AtomicBool,
    state: UnsafeCell<SlabState>,
}

/// Handle to a live slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slab(NonNull<SlabHeader>);

impl Slab {
    /// Allocate the header for a new slab. The slab starts frozen with every
    /// object accounted as in use.
    pub fn create(base: usize, bytes: usize, order: u32, objects: usize, node: NodeId) -> Self {
        let header = Box::new(SlabHeader {
            base,
            bytes,
            order,
            objects: objects as u16,
            node,
            frozen: AtomicBool::new(true),
            state: UnsafeCell::new(SlabState {
                freelist: 0,
                inuse: objects as u16,
                corrupted: false,
                prev: None,
                next: None,
            }),
        });
        Self(NonNull::from(Box::leak(header)))
    }

    /// Free the header.
    ///
    /// # Safety
    ///
    /// The slab must be unreachable from every list, cpu slot and directory.
    pub unsafe fn destroy(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }

    pub fn from_ptr(ptr: *mut SlabHeader) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut SlabHeader {
        self.0.as_ptr()
    }

    fn header(&self) -> &SlabHeader {
        unsafe { self.0.as_ref() }
    }

    pub fn base(&self) -> usize {
        self.header().base
    }

    pub fn bytes(&self) -> usize {
        self.header().bytes
    }

    pub fn order(&self) -> u32 {
        self.header().order
    }

    pub fn objects(&self) -> usize {
        self.header().objects as usize
    }

    pub fn node(&self) -> NodeId {
        self.header().node
    }

    pub fn is_frozen(&self) -> bool {
        self.header().frozen.load(Ordering::Acquire)
    }

    /// Claim the slab for a cpu. Returns false if it already was frozen.
    pub fn freeze(&self) -> bool {
        !self.header().frozen.swap(true, Ordering::AcqRel)
    }

    /// Release the cpu claim. Returns false if it was not frozen.
    pub fn unfreeze(&self) -> bool {
        self.header().frozen.swap(false, Ordering::AcqRel)
    }

    /// # Safety
    ///
    /// The caller must hold the lock of `self.node()`, and must not keep
    /// another reference to this state alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn state(&self) -> &mut SlabState {
        &mut *self.header().state.get()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let header = self.header();
        addr >= header.base && addr < header.base + header.bytes
    }

    #[inline]
    pub fn object_addr(&self, layout: &ObjectLayout, index: usize) -> usize {
        layout.object_at(self.base(), index)
    }

    /// Index of the object starting exactly at `object`.
    pub fn object_index(&self, layout: &ObjectLayout, object: usize) -> Option<usize> {
        let first = self.base() + layout.red_left_pad;
        if object < first {
            return None;
        }
        let offset = object - first;
        if offset % layout.size != 0 {
            return None;
        }
        let index = offset / layout.size;
        (index < self.objects()).then_some(index)
    }

    /// Object pointer of the object enclosing `addr`, clamped to the last
    /// object of the slab.
    pub fn nearest_obj(&self, layout: &ObjectLayout, addr: usize) -> usize {
        let base = self.base();
        let slot = addr - (addr - base) % layout.size;
        let last_slot = base + (self.objects() - 1) * layout.size;
        slot.min(last_slot) + layout.red_left_pad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::SlabFlags;

    fn layout(flags: SlabFlags) -> ObjectLayout {
        ObjectLayout::new(64, 8, flags, false, 64, 4096).unwrap()
    }

    #[test]
    fn test_slab_header() {
        let slab = Slab::create(0x10000, 4096, 0, 64, 1);
        assert_eq!(slab.objects(), 64);
        assert_eq!(slab.node(), 1);
        assert!(slab.is_frozen());
        assert!(!slab.freeze());
        assert!(slab.unfreeze());
        assert!(!slab.is_frozen());
        assert_eq!(unsafe { slab.state() }.inuse, 64);
        unsafe { slab.destroy() };
    }

    #[test]
    fn test_object_index_from_addr() {
        let l = layout(SlabFlags::empty());
        let slab = Slab::create(0x10000, 4096, 0, 64, 0);
        let obj0 = slab.object_addr(&l, 0);
        assert_eq!(slab.object_index(&l, obj0), Some(0));
        assert_eq!(slab.object_index(&l, obj0 + 64), Some(1));
        assert_eq!(slab.object_index(&l, obj0 + 63), None);
        assert_eq!(slab.object_index(&l, obj0 + 4096), None);
        assert!(slab.contains(obj0 + 4095));
        assert!(!slab.contains(obj0 + 4096));
        unsafe { slab.destroy() };
    }

    #[test]
    fn test_nearest_obj() {
        let l = layout(SlabFlags::RED_ZONE);
        let objects = 4096 / l.size;
        let slab = Slab::create(0x20000, 4096, 0, objects, 0);
        let obj3 = slab.object_addr(&l, 3);
        assert_eq!(slab.nearest_obj(&l, obj3), obj3);
        assert_eq!(slab.nearest_obj(&l, obj3 + 10), obj3);
        // A pointer into the left red zone belongs to the same object.
        assert_eq!(slab.nearest_obj(&l, obj3 - 4), obj3);
        // Tail bytes past the last object clamp to it.
        let last = slab.object_addr(&l, objects - 1);
        assert_eq!(slab.nearest_obj(&l, 0x20000 + 4095), last);
        unsafe { slab.destroy() };
    }
}
