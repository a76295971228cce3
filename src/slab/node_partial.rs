//! Per-node partial slab pool.
//!
//! Each locality domain keeps an intrusive list of slabs that are neither
//! frozen nor full. Slabs link through their own header, so list
//! operations never allocate.

use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

use super::slab_node::Slab;

/// Insert position in a partial list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListPos {
    Head,
    Tail,
}

pub(crate) struct SlabIntrusiveList {
    head: Option<Slab>,
    tail: Option<Slab>,
    len: usize,
}

// SAFETY: list entries are only dereferenced under the owning node lock
unsafe impl Send for SlabIntrusiveList {}

impl SlabIntrusiveList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<Slab> {
        self.head
    }

    /// # Safety
    ///
    /// The node lock guarding this list must be held and `slab` must belong
    /// to this node and not be on any list.
    pub unsafe fn push(&mut self, slab: Slab, pos: ListPos) {
        let state = slab.state();
        match pos {
            ListPos::Head => {
                state.prev = None;
                state.next = self.head;
                match self.head {
                    Some(head) => head.state().prev = Some(slab),
                    None => self.tail = Some(slab),
                }
                self.head = Some(slab);
            }
            ListPos::Tail => {
                state.prev = self.tail;
                state.next = None;
                match self.tail {
                    Some(tail) => tail.state().next = Some(slab),
                    None => self.head = Some(slab),
                }
                self.tail = Some(slab);
            }
        }
        self.len += 1;
    }

    /// # Safety
    ///
    /// The node lock guarding this list must be held and `slab` must be on it.
    pub unsafe fn remove(&mut self, slab: Slab) {
        let state = slab.state();
        let prev = state.prev.take();
        let next = state.next.take();

        match prev {
            Some(prev_slab) => prev_slab.state().next = next,
            None => self.head = next,
        }
        match next {
            Some(next_slab) => next_slab.state().prev = prev,
            None => self.tail = prev,
        }
        self.len = self.len.saturating_sub(1);
    }

    /// Iterate the list front to back.
    ///
    /// # Safety
    ///
    /// The node lock must be held for the whole iteration and the list must
    /// not be modified meanwhile.
    pub unsafe fn iter(&self) -> impl Iterator<Item = Slab> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let slab = cursor?;
            cursor = slab.state().next;
            Some(slab)
        })
    }
}

/// Partial list guarded by the node lock.
pub(crate) struct NodePartial {
    pub partial: SlabIntrusiveList,
}

impl NodePartial {
    pub fn nr_partial(&self) -> usize {
        self.partial.len()
    }

    /// # Safety
    ///
    /// See [`SlabIntrusiveList::push`].
    pub unsafe fn add_partial(&mut self, slab: Slab, pos: ListPos) {
        self.partial.push(slab, pos);
    }

    /// # Safety
    ///
    /// See [`SlabIntrusiveList::remove`].
    pub unsafe fn remove_partial(&mut self, slab: Slab) {
        self.partial.remove(slab);
    }
}

/// One locality domain of a cache.
pub(crate) struct KmemCacheNode {
    list: SpinNoIrq<NodePartial>,
    nr_slabs: AtomicUsize,
    total_objects: AtomicUsize,
}

impl KmemCacheNode {
    pub const fn new() -> Self {
        Self {
            list: SpinNoIrq::new(NodePartial {
                partial: SlabIntrusiveList::new(),
            }),
            nr_slabs: AtomicUsize::new(0),
            total_objects: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> kspin::SpinNoIrqGuard<'_, NodePartial> {
        self.list.lock()
    }

    pub fn inc_slabs(&self, objects: usize) {
        self.nr_slabs.fetch_add(1, Ordering::Relaxed);
        self.total_objects.fetch_add(objects, Ordering::Relaxed);
    }

    pub fn dec_slabs(&self, objects: usize) {
        self.nr_slabs.fetch_sub(1, Ordering::Relaxed);
        self.total_objects.fetch_sub(objects, Ordering::Relaxed);
    }

    pub fn nr_slabs(&self) -> usize {
        self.nr_slabs.load(Ordering::Relaxed)
    }

    pub fn total_objects(&self) -> usize {
        self.total_objects.load(Ordering::Relaxed)
    }

    pub fn nr_partial(&self) -> usize {
        self.lock().nr_partial()
    }
}
