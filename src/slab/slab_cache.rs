//! Slab cache for a single object type.
//!
//! Allocation and free first try the cpu's current slab through a single
//! compare-and-swap on the `(tid, freelist)` word. Everything else happens on
//! the slow paths, serialized per cpu by the cpu partial lock and per slab by
//! the node lock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::cpu_slab::{CpuPartial, CpuSlab};
use super::directory::SlabDirectory;
use super::hardening::{self, FreePointerCodec, SlabRng};
use super::layout::ObjectLayout;
use super::node_partial::{KmemCacheNode, ListPos};
use super::order::{self, OrderObjects, MAX_OBJS_PER_PAGE, MAX_ORDER};
use super::slab_node::Slab;
use super::stats::CacheInfo;
#[cfg(feature = "stats")]
use super::stats::{SlabStats, StatItem};
use super::{Constructor, SlabFlags};
use crate::block_allocator::{BlockAllocator, GfpFlags};
use crate::config::SlabConfig;
use crate::{AllocError, AllocResult, CpuId, NodeId};

/// A cache of equally sized objects.
///
/// Every cpu slot must be driven by at most one thread at a time; slots of
/// different cpus may be used concurrently. Objects may be freed through any
/// cpu slot, not only the one that allocated them.
pub struct SlabCache<B: BlockAllocator> {
    name: String,
    layout: ObjectLayout,
    /// Largest payload of the caches merged into this one.
    object_size: AtomicUsize,
    flags: SlabFlags,
    allocflags: GfpFlags,
    ctor: Option<Constructor>,
    oo: AtomicU32,
    min: OrderObjects,
    max: AtomicU32,
    min_partial: AtomicUsize,
    cpu_partial: AtomicUsize,
    refcount: AtomicUsize,
    codec: FreePointerCodec,
    random_seq: Option<Box<[u16]>>,
    rng: SlabRng,
    cpu_slabs: Box<[CachePadded<CpuSlab>]>,
    cpu_to_node: Box<[NodeId]>,
    nodes: Box<[KmemCacheNode]>,
    directory: SlabDirectory,
    blocks: Arc<B>,
    dead: AtomicBool,
}

impl<B: BlockAllocator> SlabCache<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        object_size: usize,
        align: usize,
        flags: SlabFlags,
        ctor: Option<Constructor>,
        config: &SlabConfig,
        seed: u64,
        blocks: Arc<B>,
    ) -> AllocResult<Self> {
        config.validate()?;
        let layout = ObjectLayout::new(
            object_size,
            align,
            flags,
            ctor.is_some(),
            config.cache_line_size,
            B::PAGE_SIZE,
        )?;
        let Some(order) = order::calculate_order(B::PAGE_SIZE, layout.size, config) else {
            warn!(
                "{}: {}-byte objects do not fit any slab order",
                name, layout.size
            );
            return Err(AllocError::InvalidParam);
        };
        let oo = OrderObjects::new(B::PAGE_SIZE, order, layout.size);
        let min = OrderObjects::new(
            B::PAGE_SIZE,
            order::get_order(B::PAGE_SIZE, layout.size),
            layout.size,
        );

        let cpu_partial = if flags.contains(SlabFlags::CPU_PARTIAL)
            && !flags.intersects(SlabFlags::DEBUG_FLAGS)
        {
            config
                .cpu_partial
                .unwrap_or_else(|| order::default_cpu_partial(B::PAGE_SIZE, layout.size))
        } else {
            0
        };
        let min_partial = config
            .min_partial
            .unwrap_or_else(|| order::default_min_partial(layout.size));

        let codec = if flags.contains(SlabFlags::FREELIST_HARDENED) {
            FreePointerCodec::Hardened {
                secret: seed as usize | 1,
            }
        } else {
            FreePointerCodec::Plain
        };
        let rng = SlabRng::new(seed.rotate_left(29) ^ 0x9e37_79b9_7f4a_7c15);
        let random_seq = (flags.contains(SlabFlags::FREELIST_RANDOM) && oo.objects() > 1)
            .then(|| hardening::random_sequence(oo.objects(), &rng));
        let allocflags = if flags.contains(SlabFlags::CACHE_DMA) {
            GfpFlags::DMA
        } else {
            GfpFlags::empty()
        };

        debug!(
            "{}: object_size={} size={} align={} order={} objects={}",
            name,
            object_size,
            layout.size,
            layout.align,
            oo.order(),
            oo.objects()
        );

        Ok(Self {
            name: String::from(name),
            layout,
            object_size: AtomicUsize::new(object_size),
            flags,
            allocflags,
            ctor,
            oo: AtomicU32::new(oo.raw()),
            min,
            max: AtomicU32::new(oo.raw()),
            min_partial: AtomicUsize::new(min_partial),
            cpu_partial: AtomicUsize::new(cpu_partial),
            refcount: AtomicUsize::new(1),
            codec,
            random_seq,
            rng,
            cpu_slabs: (0..config.nr_cpus)
                .map(|cpu| CachePadded::new(CpuSlab::new(cpu)))
                .collect(),
            cpu_to_node: (0..config.nr_cpus).map(|cpu| config.node_of(cpu)).collect(),
            nodes: (0..config.nr_nodes).map(|_| KmemCacheNode::new()).collect(),
            directory: SlabDirectory::new(B::PAGE_SIZE),
            blocks,
            dead: AtomicBool::new(false),
        })
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placement of the payload, free pointer and red zones in an object.
    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// Usable payload size of every object.
    pub fn object_size(&self) -> usize {
        self.object_size.load(Ordering::Relaxed)
    }

    /// Stride between objects.
    pub fn size(&self) -> usize {
        self.layout.size
    }

    /// Alignment of every object.
    pub fn align(&self) -> usize {
        self.layout.align
    }

    /// Flags the cache was created with.
    pub fn flags(&self) -> SlabFlags {
        self.flags
    }

    /// Whether objects are built by a constructor.
    pub fn has_ctor(&self) -> bool {
        self.ctor.is_some()
    }

    /// Order and object count used for new slabs.
    pub fn order_objects(&self) -> OrderObjects {
        OrderObjects::from_raw(self.oo.load(Ordering::Acquire))
    }

    /// Smallest order that still fits one object; the fallback floor.
    pub fn min_order_objects(&self) -> OrderObjects {
        self.min
    }

    /// Partial slabs each node keeps before empty ones are released.
    pub fn min_partial(&self) -> usize {
        self.min_partial.load(Ordering::Relaxed)
    }

    /// Free objects each cpu may hold in its partial list; zero disables it.
    pub fn cpu_partial(&self) -> usize {
        self.cpu_partial.load(Ordering::Relaxed)
    }

    /// Number of registry users sharing this cache.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Number of cpu slots.
    pub fn nr_cpus(&self) -> usize {
        self.cpu_slabs.len()
    }

    /// Number of memory nodes.
    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Change how many partial slabs each node keeps.
    pub fn set_min_partial(&self, min_partial: usize) {
        self.min_partial.store(min_partial, Ordering::Relaxed);
    }

    /// Change the per-cpu partial budget. Caches without per-cpu partials
    /// only accept zero.
    pub fn set_cpu_partial(&self, objects: usize) -> AllocResult {
        if objects > 0
            && (!self.flags.contains(SlabFlags::CPU_PARTIAL)
                || self.flags.intersects(SlabFlags::DEBUG_FLAGS))
        {
            return Err(AllocError::InvalidParam);
        }
        self.cpu_partial.store(objects, Ordering::Relaxed);
        Ok(())
    }

    /// Use `order` for slabs created from now on.
    pub fn set_order(&self, order: u32) -> AllocResult {
        if order >= MAX_ORDER || order < self.min.order() {
            return Err(AllocError::InvalidParam);
        }
        let oo = OrderObjects::new(B::PAGE_SIZE, order, self.layout.size);
        if oo.objects() == 0 || oo.objects() > MAX_OBJS_PER_PAGE {
            return Err(AllocError::InvalidParam);
        }
        self.oo.store(oo.raw(), Ordering::Release);
        self.max.fetch_max(oo.raw(), Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true if it was the last one.
    pub(crate) fn put(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Let a merged cache of `object_size` bytes share this one.
    pub(crate) fn widen(&self, object_size: usize) {
        self.object_size.fetch_max(object_size, Ordering::Relaxed);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn cpu_slab(&self, cpu: CpuId) -> AllocResult<&CpuSlab> {
        self.cpu_slabs
            .get(cpu)
            .map(|slot| &**slot)
            .ok_or(AllocError::InvalidParam)
    }

    fn slab_of(&self, addr: usize) -> Option<Slab> {
        let max = OrderObjects::from_raw(self.max.load(Ordering::Acquire)).order();
        self.directory.lookup(addr, self.min.order()..=max)
    }

    #[inline]
    fn get_freepointer(&self, object: usize) -> usize {
        let ptr_addr = self.layout.freeptr_addr(object);
        // SAFETY: free pointer slots are word aligned and lie inside a live slab.
        let stored = unsafe { (*(ptr_addr as *const AtomicUsize)).load(Ordering::Relaxed) };
        self.codec.decode(stored, ptr_addr)
    }

    #[inline]
    fn set_freepointer(&self, object: usize, next: usize) {
        let ptr_addr = self.layout.freeptr_addr(object);
        // SAFETY: see `get_freepointer`.
        unsafe {
            (*(ptr_addr as *const AtomicUsize))
                .store(self.codec.encode(next, ptr_addr), Ordering::Relaxed)
        };
    }

    /// Index of the object following `object` on a freelist of `slab`.
    ///
    /// `Err` carries a decoded pointer that is not an object of the slab.
    fn next_index(&self, slab: Slab, object: usize) -> Result<Option<usize>, usize> {
        let next = self.get_freepointer(object);
        if next == 0 {
            return Ok(None);
        }
        slab.object_index(&self.layout, next).map(Some).ok_or(next)
    }

    fn report_bad_freepointer(&self, object: usize, next: usize) {
        error!(
            "{}: object {:#x} holds a damaged free pointer ({:#x}); the rest of its freelist is dropped",
            self.name, object, next
        );
    }

    /// Walk a chain to its last intact object and count the objects up to
    /// it. A walk that meets a damaged pointer or a cycle stops before the
    /// object holding it and sets the flag; the tail is `None` when that
    /// object is `head` itself.
    fn chain_tail(&self, slab: Slab, head: usize) -> (Option<usize>, usize, bool) {
        let mut prev = None;
        let mut cursor = head;
        let mut count = 0;
        loop {
            match self.next_index(slab, cursor) {
                Ok(None) => return (Some(cursor), count + 1, false),
                Ok(Some(index)) if count + 1 < slab.objects() => {
                    prev = Some(cursor);
                    cursor = slab.object_addr(&self.layout, index);
                    count += 1;
                }
                Ok(Some(_)) | Err(_) => return (prev, count, true),
            }
        }
    }

    fn on_chain(&self, slab: Slab, head: usize, object: usize) -> bool {
        let mut cursor = head;
        for _ in 0..slab.objects() {
            if cursor == 0 {
                break;
            }
            if cursor == object {
                return true;
            }
            cursor = match self.next_index(slab, cursor) {
                Ok(Some(index)) => slab.object_addr(&self.layout, index),
                _ => break,
            };
        }
        false
    }

    /// Allocate one object on behalf of `cpu`.
    ///
    /// With a node hint the object comes from a slab of that node.
    pub fn alloc(&self, cpu: CpuId, node: Option<NodeId>) -> AllocResult<NonNull<u8>> {
        self.alloc_with(cpu, node, GfpFlags::empty())
    }

    /// Like [`alloc`](Self::alloc), with the payload zeroed.
    pub fn alloc_zeroed(&self, cpu: CpuId, node: Option<NodeId>) -> AllocResult<NonNull<u8>> {
        self.alloc_with(cpu, node, GfpFlags::ZERO)
    }

    /// Allocate with explicit [`GfpFlags`]. `ZERO` is rejected with
    /// [`AllocError::InvalidParam`] on caches that have a constructor.
    pub fn alloc_with(
        &self,
        cpu: CpuId,
        node: Option<NodeId>,
        gfp: GfpFlags,
    ) -> AllocResult<NonNull<u8>> {
        let c = self.cpu_slab(cpu)?;
        if node.is_some_and(|node| node >= self.nodes.len()) || self.is_dead() {
            return Err(AllocError::InvalidParam);
        }
        if gfp.contains(GfpFlags::ZERO) && self.ctor.is_some() {
            warn!("{}: zeroing would wipe constructed objects", self.name);
            return Err(AllocError::InvalidParam);
        }

        let object = loop {
            if let Some(object) = self.alloc_fast(c, node) {
                break object;
            }
            if let Some(object) = self.alloc_slow(cpu, c, node, gfp)? {
                break object;
            }
        };

        if gfp.contains(GfpFlags::ZERO) {
            // SAFETY: the object is ours and at least `object_size` bytes long.
            unsafe { core::ptr::write_bytes(object as *mut u8, 0, self.object_size()) };
        }
        NonNull::new(object as *mut u8).ok_or(AllocError::NoMemory)
    }

    fn alloc_fast(&self, c: &CpuSlab, node: Option<NodeId>) -> Option<usize> {
        loop {
            let seen = c.load();
            let slab = c.current()?;
            let index = seen.freelist()?;
            if node.is_some_and(|node| node != slab.node()) {
                return None;
            }
            if index >= slab.objects() {
                // The slot switched slabs between the two loads.
                if c.load() != seen {
                    continue;
                }
                return None;
            }
            let object = slab.object_addr(&self.layout, index);
            let next = self.next_index(slab, object).ok()?;
            if c.try_update(seen, seen.advance(next)) {
                stat!(c, AllocFastpath);
                return Some(object);
            }
            stat!(c, CmpxchgDoubleCpuFail);
        }
    }

    /// `Ok(None)` asks the caller to retry the fast path.
    fn alloc_slow(
        &self,
        cpu: CpuId,
        c: &CpuSlab,
        node: Option<NodeId>,
        gfp: GfpFlags,
    ) -> AllocResult<Option<usize>> {
        let mut partial = c.lock_partial();
        stat!(c, AllocSlowpath);

        let target = node.unwrap_or(self.cpu_to_node[cpu]);
        let strict = node.is_some() || gfp.contains(GfpFlags::THISNODE);
        let node_ok = |slab: Slab| node.map_or(true, |node| node == slab.node());

        loop {
            if let Some(slab) = c.current() {
                if !node_ok(slab) {
                    stat!(c, AllocNodeMismatch);
                    self.deactivate_slab(c);
                    continue;
                }
                if let Some(index) = c.load().freelist() {
                    let object = slab.object_addr(&self.layout, index);
                    match self.next_index(slab, object) {
                        Ok(_) => return Ok(None),
                        Err(next) => {
                            c.take_freelist();
                            self.report_bad_freepointer(object, next);
                            self.mark_corrupted(slab);
                        }
                    }
                }
                if let Some(head) = self.get_freelist(c, slab) {
                    stat!(c, AllocRefill);
                    if let Some(object) = self.install_and_take(c, slab, head) {
                        return Ok(Some(object));
                    }
                }
                continue;
            }

            if let Some(slab) = partial.take(node_ok) {
                stat!(c, CpuPartialAlloc);
                c.install(slab, None);
                continue;
            }

            if let Some((slab, head)) = self.get_partial(c, &mut partial, target, strict) {
                stat!(c, AllocFromPartial);
                if let Some(object) = self.install_and_take(c, slab, head) {
                    return Ok(Some(object));
                }
                continue;
            }

            let (slab, head) = self.new_slab(c, target, gfp)?;
            stat!(c, AllocSlab);
            if let Some(object) = self.install_and_take(c, slab, head) {
                return Ok(Some(object));
            }
        }
    }

    /// Hand `head` to the caller and the rest of its chain to the cpu.
    fn install_and_take(&self, c: &CpuSlab, slab: Slab, head: usize) -> Option<usize> {
        match self.next_index(slab, head) {
            Ok(next) => {
                c.install(slab, next);
                Some(head)
            }
            Err(next) => {
                self.report_bad_freepointer(head, next);
                self.mark_corrupted(slab);
                c.install(slab, None);
                None
            }
        }
    }

    fn mark_corrupted(&self, slab: Slab) {
        let _n = self.nodes[slab.node()].lock();
        // SAFETY: node lock held.
        unsafe { slab.state().corrupted = true };
    }

    /// Take the current slab's own freelist. If it is empty the slab leaves
    /// the cpu as a full slab.
    fn get_freelist(&self, c: &CpuSlab, slab: Slab) -> Option<usize> {
        let _n = self.nodes[slab.node()].lock();
        // SAFETY: node lock held.
        let st = unsafe { slab.state() };
        let head = core::mem::take(&mut st.freelist);
        if head == 0 {
            c.take_freelist();
            c.take_slab();
            slab.unfreeze();
            stat!(c, DeactivateBypass);
            return None;
        }
        st.inuse = slab.objects() as u16;
        Some(head)
    }

    fn get_partial(
        &self,
        c: &CpuSlab,
        partial: &mut CpuPartial,
        target: NodeId,
        strict: bool,
    ) -> Option<(Slab, usize)> {
        if let Some(found) = self.get_partial_node(c, partial, target) {
            return Some(found);
        }
        if strict {
            return None;
        }
        (0..self.nodes.len())
            .filter(|&node| node != target)
            .find_map(|node| self.get_partial_node(c, partial, node))
    }

    /// Freeze the first partial slab of `node` for the cpu, plus more slabs
    /// into its partial list while their free objects fit the budget.
    fn get_partial_node(
        &self,
        c: &CpuSlab,
        partial: &mut CpuPartial,
        node: NodeId,
    ) -> Option<(Slab, usize)> {
        let cpu_partial = self.cpu_partial();
        let mut n = self.nodes[node].lock();
        let mut first = None;
        let mut available = 0;
        let mut cursor = n.partial.front();

        while let Some(slab) = cursor {
            // SAFETY: node lock held for the whole walk.
            let (free, next) = unsafe {
                let st = slab.state();
                (slab.objects() - st.inuse as usize, st.next)
            };
            if first.is_some() && partial.pobjects + free > cpu_partial {
                break;
            }
            cursor = next;
            // SAFETY: node lock held; the slab is on this node's list.
            unsafe { n.remove_partial(slab) };
            slab.freeze();
            available += free;
            if first.is_none() {
                // SAFETY: node lock held.
                let st = unsafe { slab.state() };
                let head = core::mem::take(&mut st.freelist);
                st.inuse = slab.objects() as u16;
                first = Some((slab, head));
            } else {
                partial.push(slab, free);
                stat!(c, CpuPartialNode);
            }
            if cpu_partial == 0 || available > cpu_partial / 2 {
                break;
            }
        }
        first
    }

    /// Carve a fresh slab. The returned slab is frozen and every object is
    /// on the returned chain.
    fn new_slab(&self, c: &CpuSlab, node: NodeId, gfp: GfpFlags) -> AllocResult<(Slab, usize)> {
        let flags = (gfp - GfpFlags::ZERO) | self.allocflags;
        let min_order = self.min.order();
        let mut order = self.order_objects().order();

        let base = loop {
            let attempt = if order > min_order {
                flags | GfpFlags::NOWARN | GfpFlags::NORETRY
            } else {
                flags
            };
            match self.blocks.alloc_block(order, node, attempt) {
                Ok(base) => break base,
                Err(_) if order > min_order => {
                    stat!(c, OrderFallback);
                    debug!("{}: order {} unavailable, trying {}", self.name, order, order - 1);
                    order -= 1;
                }
                Err(err) => {
                    warn!(
                        "{}: cannot allocate a slab (order {}, node {})",
                        self.name, order, node
                    );
                    return Err(err);
                }
            }
        };

        let objects = order::order_objects(B::PAGE_SIZE, order, self.layout.size);
        let slab = Slab::create(base, B::PAGE_SIZE << order, order, objects, node);
        let start = self.rng.below(objects);
        let head = match &self.random_seq {
            Some(seq) if seq.len() >= objects => {
                self.link_objects(slab, hardening::shuffled_indices(seq, start, objects))
            }
            Some(_) => {
                let seq = hardening::random_sequence(objects, &self.rng);
                self.link_objects(slab, seq.iter().map(|&index| index as usize))
            }
            None => self.link_objects(slab, 0..objects),
        };

        self.directory.insert(slab);
        self.nodes[node].inc_slabs(objects);
        Ok((slab, head))
    }

    /// Prepare every object of a new slab and chain them in `indices` order.
    fn link_objects(&self, slab: Slab, indices: impl Iterator<Item = usize>) -> usize {
        let mut head = 0;
        let mut last = 0;
        for index in indices {
            let object = slab.object_addr(&self.layout, index);
            if self.flags.contains(SlabFlags::RED_ZONE) {
                // SAFETY: `object` is an object of the fresh slab.
                unsafe { hardening::paint_red_zones(&self.layout, object) };
            }
            if let Some(ctor) = self.ctor {
                // SAFETY: object addresses are never null.
                ctor(unsafe { NonNull::new_unchecked(object as *mut u8) });
            }
            if last == 0 {
                head = object;
            } else {
                self.set_freepointer(last, object);
            }
            last = object;
        }
        self.set_freepointer(last, 0);
        head
    }

    /// Give the cpu's current slab back to its node.
    fn deactivate_slab(&self, c: &CpuSlab) {
        let freelist = c.take_freelist();
        let Some(slab) = c.take_slab() else {
            return;
        };

        let mut n = self.nodes[slab.node()].lock();
        let (inuse, has_free) = {
            // SAFETY: node lock held.
            let st = unsafe { slab.state() };
            if st.freelist != 0 {
                stat!(c, DeactivateRemoteFrees);
            }
            if let Some(index) = freelist {
                let head = slab.object_addr(&self.layout, index);
                let (tail, count, damaged) = self.chain_tail(slab, head);
                let count = count as u16;
                if damaged || count > st.inuse {
                    error!(
                        "{}: cpu freelist of slab {:#x} is damaged; {} objects kept",
                        self.name,
                        slab.base(),
                        count
                    );
                    st.corrupted = true;
                }
                // Objects from the damaged one on stay counted in `inuse`.
                if let Some(tail) = tail {
                    self.set_freepointer(tail, st.freelist);
                    st.freelist = head;
                    st.inuse = st.inuse.saturating_sub(count);
                }
            }
            (st.inuse, st.freelist != 0)
        };
        slab.unfreeze();

        let discard = if inuse == 0 && n.nr_partial() >= self.min_partial() {
            stat!(c, DeactivateEmpty);
            true
        } else {
            if inuse == 0 {
                // SAFETY: node lock held and the slab is on no list.
                unsafe { n.add_partial(slab, ListPos::Tail) };
                stat!(c, DeactivateEmpty);
                stat!(c, DeactivateToTail);
            } else if has_free {
                unsafe { n.add_partial(slab, ListPos::Head) };
                stat!(c, DeactivateToHead);
            } else {
                stat!(c, DeactivateFull);
            }
            false
        };
        drop(n);

        if discard {
            stat!(c, FreeSlab);
            self.discard_slab(slab);
        }
    }

    /// Move every slab of the cpu partial list to its node.
    fn unfreeze_partials(&self, c: &CpuSlab, partial: &mut CpuPartial) {
        let mut discard = Vec::new();
        for (slab, _) in partial.slabs.drain(..) {
            let mut n = self.nodes[slab.node()].lock();
            // SAFETY: node lock held.
            let (inuse, has_free) = {
                let st = unsafe { slab.state() };
                (st.inuse, st.freelist != 0)
            };
            slab.unfreeze();
            if inuse == 0 && n.nr_partial() >= self.min_partial() {
                discard.push(slab);
            } else if has_free {
                unsafe { n.add_partial(slab, ListPos::Tail) };
                stat!(c, FreeAddPartial);
            }
        }
        partial.pobjects = 0;

        for slab in discard {
            stat!(c, FreeSlab);
            self.discard_slab(slab);
        }
    }

    fn put_cpu_partial(&self, c: &CpuSlab, slab: Slab, free: usize) {
        let mut partial = c.lock_partial();
        partial.push(slab, free);
        stat!(c, CpuPartialFree);
        if partial.pobjects > self.cpu_partial() {
            self.unfreeze_partials(c, &mut partial);
            stat!(c, CpuPartialDrain);
        }
    }

    /// Release a slab that is on no list and in no cpu slot.
    fn discard_slab(&self, slab: Slab) {
        self.directory.remove(slab);
        self.nodes[slab.node()].dec_slabs(slab.objects());
        self.blocks.free_block(slab.base(), slab.order());
        // SAFETY: the slab is now unreachable.
        unsafe { slab.destroy() };
    }

    /// Return `ptr` to the cache on behalf of `cpu`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation from this cache and
    /// not freed since. Damage the checks catch is reported as
    /// [`AllocError::Corrupted`]; anything else is undefined behavior.
    pub unsafe fn free(&self, cpu: CpuId, ptr: NonNull<u8>) -> AllocResult {
        let c = self.cpu_slab(cpu)?;
        let object = ptr.as_ptr() as usize;

        let current = c.current().filter(|slab| slab.contains(object));
        let slab = match current {
            Some(slab) => slab,
            None => self.slab_of(object).ok_or(AllocError::NotAllocated)?,
        };
        let index = slab
            .object_index(&self.layout, object)
            .ok_or(AllocError::NotAllocated)?;

        if self.flags.contains(SlabFlags::RED_ZONE) {
            if let Some(at) = hardening::check_red_zones(&self.layout, object) {
                error!(
                    "{}: red zone of object {:#x} overwritten at {:#x}",
                    self.name, object, at
                );
                return Err(AllocError::Corrupted);
            }
        }

        if current.is_some() && self.free_fast(c, slab, object, index)? {
            return Ok(());
        }
        self.free_slow(c, slab, object)
    }

    /// `Ok(false)` when the slab stopped being the cpu's current slab.
    fn free_fast(&self, c: &CpuSlab, slab: Slab, object: usize, index: usize) -> AllocResult<bool> {
        let consistency = self.flags.contains(SlabFlags::CONSISTENCY_CHECKS);
        loop {
            let seen = c.load();
            if c.current() != Some(slab) {
                return Ok(false);
            }
            let head = seen.freelist().map(|i| slab.object_addr(&self.layout, i));
            if head == Some(object)
                || (consistency && head.is_some_and(|head| self.on_chain(slab, head, object)))
            {
                error!("{}: double free of object {:#x}", self.name, object);
                return Err(AllocError::Corrupted);
            }
            self.set_freepointer(object, head.unwrap_or(0));
            if c.try_update(seen, seen.advance(Some(index))) {
                stat!(c, FreeFastpath);
                return Ok(true);
            }
            stat!(c, CmpxchgDoubleCpuFail);
        }
    }

    fn free_slow(&self, c: &CpuSlab, slab: Slab, object: usize) -> AllocResult {
        stat!(c, FreeSlowpath);
        let mut n = self.nodes[slab.node()].lock();
        let (prior, inuse) = {
            // SAFETY: node lock held.
            let st = unsafe { slab.state() };
            let prior = st.freelist;
            let repeated = prior == object
                || (self.flags.contains(SlabFlags::CONSISTENCY_CHECKS)
                    && self.on_chain(slab, prior, object));
            if repeated || st.inuse == 0 {
                error!("{}: double free of object {:#x}", self.name, object);
                return Err(AllocError::Corrupted);
            }
            self.set_freepointer(object, prior);
            st.freelist = object;
            st.inuse -= 1;
            (prior, st.inuse)
        };

        if slab.is_frozen() {
            stat!(c, FreeFrozen);
            return Ok(());
        }

        if prior == 0 && self.cpu_partial() > 0 {
            slab.freeze();
            drop(n);
            self.put_cpu_partial(c, slab, slab.objects() - inuse as usize);
            return Ok(());
        }

        if inuse == 0 && n.nr_partial() >= self.min_partial() {
            if prior != 0 {
                // SAFETY: a slab with free objects that is not frozen is listed.
                unsafe { n.remove_partial(slab) };
                stat!(c, FreeRemovePartial);
            }
            drop(n);
            stat!(c, FreeSlab);
            self.discard_slab(slab);
            return Ok(());
        }

        if prior == 0 {
            // SAFETY: node lock held; the slab was full and untracked.
            unsafe { n.add_partial(slab, ListPos::Head) };
            stat!(c, FreeAddPartial);
        }
        Ok(())
    }

    /// Deactivate the current slab of `cpu` and drain its partial list.
    ///
    /// Must not race with allocations or frees through the same cpu.
    pub fn flush_cpu(&self, cpu: CpuId) -> AllocResult {
        let c = self.cpu_slab(cpu)?;
        let mut partial = c.lock_partial();
        if c.current().is_some() {
            stat!(c, CpuslabFlush);
            self.deactivate_slab(c);
        }
        self.unfreeze_partials(c, &mut partial);
        Ok(())
    }

    /// Release every empty slab held in the node pools. Returns the number
    /// of slabs released.
    pub fn shrink(&self) -> usize {
        let mut discard = Vec::new();
        for node in self.nodes.iter() {
            let mut n = node.lock();
            // SAFETY: node lock held.
            let empty: Vec<Slab> = unsafe {
                n.partial
                    .iter()
                    .filter(|slab| slab.state().inuse == 0)
                    .collect()
            };
            for slab in empty {
                unsafe { n.remove_partial(slab) };
                discard.push(slab);
            }
        }
        let released = discard.len();
        for slab in discard {
            self.discard_slab(slab);
        }
        released
    }

    /// Flush every cpu and release all slabs.
    ///
    /// Fails with [`AllocError::InUse`] while objects are live, unless
    /// `forced`, in which case the slabs holding them are leaked.
    pub(crate) fn shutdown(&self, forced: bool) -> AllocResult {
        if self.is_dead() {
            return Ok(());
        }
        for cpu in 0..self.cpu_slabs.len() {
            self.flush_cpu(cpu)?;
        }
        self.shrink();

        let live: usize = self.nodes.iter().map(|node| node.nr_slabs()).sum();
        if live > 0 {
            if !forced {
                warn!("{}: {} slabs still hold objects", self.name, live);
                return Err(AllocError::InUse);
            }
            error!(
                "{}: destroyed with {} slabs in use, leaking their memory",
                self.name, live
            );
            for node in self.nodes.iter() {
                let mut n = node.lock();
                while let Some(slab) = n.partial.front() {
                    // SAFETY: node lock held.
                    unsafe { n.remove_partial(slab) };
                }
            }
            for slab in self.directory.drain() {
                // SAFETY: the directory held the last reference.
                unsafe { slab.destroy() };
            }
        }
        self.dead.store(true, Ordering::Release);
        Ok(())
    }

    /// Check every slab in the node pools against its freelist and the
    /// slab accounting. Meant for quiescent caches. Returns the number of
    /// pooled slabs checked.
    ///
    /// A pooled slab that lost objects to a damaged freelist fails the
    /// check with [`AllocError::Corrupted`].
    pub fn validate(&self) -> AllocResult<usize> {
        let mut checked = 0;
        for (id, node) in self.nodes.iter().enumerate() {
            let n = node.lock();
            // SAFETY: node lock held for the walk.
            for slab in unsafe { n.partial.iter() } {
                let (head, inuse, corrupted) = {
                    let st = unsafe { slab.state() };
                    (st.freelist, st.inuse as usize, st.corrupted)
                };
                if slab.is_frozen() || slab.node() != id || head == 0 {
                    error!("{}: slab {:#x} does not belong on node {}", self.name, slab.base(), id);
                    return Err(AllocError::Corrupted);
                }
                if corrupted {
                    error!("{}: slab {:#x} lost objects to a damaged freelist", self.name, slab.base());
                    return Err(AllocError::Corrupted);
                }
                match self.count_free(slab, head) {
                    Some(free) if free + inuse == slab.objects() => checked += 1,
                    _ => {
                        error!(
                            "{}: freelist of slab {:#x} disagrees with inuse {}",
                            self.name,
                            slab.base(),
                            inuse
                        );
                        return Err(AllocError::Corrupted);
                    }
                }
            }
        }
        let nr_slabs: usize = self.nodes.iter().map(|node| node.nr_slabs()).sum();
        if self.directory.len() != nr_slabs {
            error!(
                "{}: {} slabs registered but {} accounted",
                self.name,
                self.directory.len(),
                nr_slabs
            );
            return Err(AllocError::Corrupted);
        }
        Ok(checked)
    }

    fn count_free(&self, slab: Slab, head: usize) -> Option<usize> {
        let mut count = 0;
        let mut cursor = head;
        while cursor != 0 {
            count += 1;
            if count > slab.objects() {
                return None;
            }
            if self.flags.contains(SlabFlags::RED_ZONE) {
                // SAFETY: `cursor` is an object of `slab`.
                if unsafe { hardening::check_red_zones(&self.layout, cursor) }.is_some() {
                    return None;
                }
            }
            cursor = match self.next_index(slab, cursor) {
                Ok(Some(index)) => slab.object_addr(&self.layout, index),
                Ok(None) => 0,
                Err(_) => return None,
            };
        }
        Some(count)
    }

    /// Start of the object containing `addr`, if `addr` lies in a slab of
    /// this cache.
    pub fn nearest_obj(&self, addr: usize) -> Option<NonNull<u8>> {
        let slab = self.slab_of(addr)?;
        NonNull::new(slab.nearest_obj(&self.layout, addr) as *mut u8)
    }

    /// Node of the slab holding `ptr`.
    pub fn node_of_object(&self, ptr: NonNull<u8>) -> Option<NodeId> {
        self.slab_of(ptr.as_ptr() as usize).map(|slab| slab.node())
    }

    /// Free objects reserved in the partial list of `cpu`.
    pub fn cpu_partial_objects(&self, cpu: CpuId) -> AllocResult<usize> {
        Ok(self.cpu_slab(cpu)?.lock_partial().pobjects)
    }

    /// Slabs in the partial list of `cpu`.
    pub fn cpu_partial_slabs(&self, cpu: CpuId) -> AllocResult<usize> {
        Ok(self.cpu_slab(cpu)?.lock_partial().slabs.len())
    }

    /// Slabs in the partial pool of `node`.
    pub fn node_partial_len(&self, node: NodeId) -> AllocResult<usize> {
        self.nodes
            .get(node)
            .map(|node| node.nr_partial())
            .ok_or(AllocError::InvalidParam)
    }

    /// Slabinfo-style summary of the cache.
    pub fn info(&self) -> CacheInfo {
        let oo = self.order_objects();
        CacheInfo {
            name: self.name.clone(),
            object_size: self.object_size(),
            size: self.layout.size,
            align: self.layout.align,
            order: oo.order(),
            objects_per_slab: oo.objects(),
            min_partial: self.min_partial(),
            cpu_partial: self.cpu_partial(),
            refcount: self.refcount(),
            nr_slabs: self.nodes.iter().map(|node| node.nr_slabs()).sum(),
            total_objects: self.nodes.iter().map(|node| node.total_objects()).sum(),
            node_partial: self.nodes.iter().map(|node| node.nr_partial()).collect(),
        }
    }

    /// Event counters summed over every cpu.
    #[cfg(feature = "stats")]
    pub fn stats_snapshot(&self) -> SlabStats {
        let mut stats = SlabStats::new();
        for c in self.cpu_slabs.iter() {
            for item in StatItem::ALL {
                stats.add(item, c.stat_count(item));
            }
        }
        stats
    }
}

impl<B: BlockAllocator> Drop for SlabCache<B> {
    fn drop(&mut self) {
        let _ = self.shutdown(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_allocator::HeapBlockAllocator;
    use alloc::vec;

    type Heap = HeapBlockAllocator<4096>;

    fn cache(size: usize, flags: SlabFlags, config: SlabConfig) -> (SlabCache<Heap>, Arc<Heap>) {
        let blocks = Arc::new(Heap::new());
        let cache = SlabCache::new("test", size, 8, flags, None, &config, 42, blocks.clone())
            .unwrap();
        (cache, blocks)
    }

    #[test]
    fn test_alloc_and_free_single_object() {
        let (cache, blocks) = cache(64, SlabFlags::empty(), SlabConfig::new(1, 1));
        let obj = cache.alloc(0, None).unwrap();
        assert_eq!(obj.as_ptr() as usize % 8, 0);
        assert_eq!(blocks.live_blocks(), 1);
        unsafe { cache.free(0, obj).unwrap() };
        cache.shutdown(false).unwrap();
        assert_eq!(blocks.live_blocks(), 0);
    }

    #[test]
    fn test_freed_object_is_reused_first() {
        let (cache, _) = cache(128, SlabFlags::empty(), SlabConfig::new(1, 1));
        let a = cache.alloc(0, None).unwrap();
        let _b = cache.alloc(0, None).unwrap();
        unsafe { cache.free(0, a).unwrap() };
        assert_eq!(cache.alloc(0, None).unwrap(), a);
    }

    #[test]
    fn test_full_slab_rolls_over() {
        let (cache, blocks) = cache(64, SlabFlags::empty(), SlabConfig::new(1, 1));
        assert_eq!(cache.order_objects().objects(), 64);
        let objs: Vec<_> = (0..65).map(|_| cache.alloc(0, None).unwrap()).collect();
        assert_eq!(blocks.live_blocks(), 2);
        assert_eq!(cache.info().nr_slabs, 2);
        for obj in objs {
            unsafe { cache.free(0, obj).unwrap() };
        }
        cache.shutdown(false).unwrap();
    }

    #[test]
    fn test_remote_free_goes_to_slab_freelist() {
        let (cache, _) = cache(64, SlabFlags::empty(), SlabConfig::new(2, 1));
        let a = cache.alloc(0, None).unwrap();
        let b = cache.alloc(0, None).unwrap();
        // cpu 1 has no current slab, so this is a slow free into a frozen slab.
        unsafe { cache.free(1, a).unwrap() };
        unsafe { cache.free(0, b).unwrap() };
        #[cfg(feature = "stats")]
        assert_eq!(cache.stats_snapshot()[StatItem::FreeFrozen], 1);
        cache.flush_cpu(0).unwrap();
        assert_eq!(cache.validate().unwrap(), 1);
        cache.shutdown(false).unwrap();
    }

    #[test]
    fn test_unknown_pointer_is_rejected() {
        let (cache, _) = cache(64, SlabFlags::empty(), SlabConfig::new(1, 1));
        let obj = cache.alloc(0, None).unwrap();
        let mut outside = 0u64;
        let outside = NonNull::from(&mut outside).cast::<u8>();
        assert_eq!(unsafe { cache.free(0, outside) }, Err(AllocError::NotAllocated));
        let inside = unsafe { NonNull::new_unchecked(obj.as_ptr().add(1)) };
        assert_eq!(unsafe { cache.free(0, inside) }, Err(AllocError::NotAllocated));
        assert_eq!(cache.alloc(7, None), Err(AllocError::InvalidParam));
        unsafe { cache.free(0, obj).unwrap() };
    }

    #[test]
    fn test_double_free_at_head() {
        let (cache, _) = cache(64, SlabFlags::FREELIST_HARDENED, SlabConfig::new(1, 1));
        let a = cache.alloc(0, None).unwrap();
        unsafe {
            cache.free(0, a).unwrap();
            assert_eq!(cache.free(0, a), Err(AllocError::Corrupted));
        }
    }

    #[test]
    fn test_hardened_pointer_damage_is_contained() {
        let (cache, _) = cache(64, SlabFlags::FREELIST_HARDENED, SlabConfig::new(1, 1));
        let objs: Vec<_> = (0..4).map(|_| cache.alloc(0, None).unwrap()).collect();
        unsafe {
            for &obj in &objs {
                cache.free(0, obj).unwrap();
            }
            // Use after free: scribble over the head's free pointer.
            objs[3].as_ptr().cast::<usize>().write(0x1234);
        }
        // The damaged head is never handed out again.
        for _ in 0..8 {
            let obj = cache.alloc(0, None).unwrap();
            assert_ne!(obj, objs[3]);
        }
    }

    #[test]
    fn test_zeroed_alloc() {
        let (cache, _) = cache(96, SlabFlags::empty(), SlabConfig::new(1, 1));
        let obj = cache.alloc(0, None).unwrap();
        unsafe {
            core::ptr::write_bytes(obj.as_ptr(), 0xa5, 96);
            cache.free(0, obj).unwrap();
        }
        let obj = cache.alloc_zeroed(0, None).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(obj.as_ptr(), 96) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_order() {
        let (cache, _) = cache(64, SlabFlags::empty(), SlabConfig::new(1, 1));
        assert_eq!(cache.set_order(MAX_ORDER), Err(AllocError::InvalidParam));
        cache.set_order(2).unwrap();
        let obj = cache.alloc(0, None).unwrap();
        assert_eq!(cache.info().total_objects, 4 * 4096 / 64);
        assert!(cache.nearest_obj(obj.as_ptr() as usize + 3) == Some(obj));
        unsafe { cache.free(0, obj).unwrap() };
    }

    #[test]
    fn test_cpu_partial_only_with_flag() {
        let (cache, _) = cache(64, SlabFlags::empty(), SlabConfig::new(1, 1));
        assert_eq!(cache.cpu_partial(), 0);
        assert_eq!(cache.set_cpu_partial(4), Err(AllocError::InvalidParam));
        let (cache, _) = cache_with_partial();
        assert_eq!(cache.cpu_partial(), 30);
        cache.set_cpu_partial(8).unwrap();
        assert_eq!(cache.cpu_partial(), 8);
    }

    #[test]
    fn test_zeroing_rejected_with_constructor() {
        fn ctor(obj: NonNull<u8>) {
            unsafe { obj.as_ptr().write(0x5a) };
        }
        let blocks = Arc::new(Heap::new());
        let config = SlabConfig::new(1, 1);
        let flags = SlabFlags::empty();
        let cache =
            SlabCache::new("ctor", 32, 8, flags, Some(ctor), &config, 1, blocks.clone()).unwrap();
        assert_eq!(cache.alloc_zeroed(0, None), Err(AllocError::InvalidParam));
        assert_eq!(blocks.live_blocks(), 0);
        let obj = cache.alloc(0, None).unwrap();
        assert_eq!(unsafe { obj.as_ptr().read() }, 0x5a);
        unsafe { cache.free(0, obj).unwrap() };
    }

    fn cache_with_partial() -> (SlabCache<Heap>, Arc<Heap>) {
        cache(64, SlabFlags::CPU_PARTIAL, SlabConfig::new(1, 1))
    }

    #[test]
    fn test_constructor_runs_once_per_object() {
        fn ctor(obj: NonNull<u8>) {
            unsafe { obj.as_ptr().write(0x5a) };
        }
        let blocks = Arc::new(Heap::new());
        let config = SlabConfig::new(1, 1);
        let cache = SlabCache::new("ctor", 32, 8, SlabFlags::empty(), Some(ctor), &config, 1, blocks)
            .unwrap();
        let objs: Vec<_> = (0..3).map(|_| cache.alloc(0, None).unwrap()).collect();
        for obj in &objs {
            assert_eq!(unsafe { obj.as_ptr().read() }, 0x5a);
        }
        let mut seen = vec![];
        for obj in objs {
            seen.push(obj);
            unsafe { cache.free(0, obj).unwrap() };
        }
        // Freeing keeps the constructed state: the free pointer lives outside the payload.
        let again = cache.alloc(0, None).unwrap();
        assert!(seen.contains(&again));
        assert_eq!(unsafe { again.as_ptr().read() }, 0x5a);
    }
}
