//! Cache registry.
//!
//! Owns every cache created over one backing allocator. Compatible caches
//! are merged: a new cache whose objects fit an existing one shares it and
//! bumps its reference count.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{info, warn};

use super::hardening::SlabRng;
use super::layout::ObjectLayout;
use super::slab_cache::SlabCache;
use super::{Constructor, SlabFlags};
use crate::block_allocator::BlockAllocator;
use crate::config::SlabConfig;
use crate::{AllocError, AllocResult};

/// Owner of the caches carved from one backing allocator.
pub struct SlabRegistry<B: BlockAllocator> {
    config: SlabConfig,
    blocks: Arc<B>,
    rng: SlabRng,
    caches: SpinNoIrq<Vec<Arc<SlabCache<B>>>>,
}

impl<B: BlockAllocator> SlabRegistry<B> {
    /// Create an empty registry over `blocks`.
    pub fn new(config: SlabConfig, blocks: Arc<B>) -> AllocResult<Self> {
        config.validate()?;
        Ok(Self {
            rng: SlabRng::new(config.seed),
            config,
            blocks,
            caches: SpinNoIrq::new(Vec::new()),
        })
    }

    /// Configuration shared by every cache.
    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    /// Backing block allocator.
    pub fn blocks(&self) -> &Arc<B> {
        &self.blocks
    }

    /// Create a cache of `object_size`-byte objects aligned to `align`
    /// (zero for the minimum alignment), or share a compatible one.
    pub fn create_cache(
        &self,
        name: &str,
        object_size: usize,
        align: usize,
        flags: SlabFlags,
        ctor: Option<Constructor>,
    ) -> AllocResult<Arc<SlabCache<B>>> {
        if name.is_empty() {
            return Err(AllocError::InvalidParam);
        }
        let layout = ObjectLayout::new(
            object_size,
            align,
            flags,
            ctor.is_some(),
            self.config.cache_line_size,
            B::PAGE_SIZE,
        )?;

        let mut caches = self.caches.lock();
        if let Some(cache) = find_mergeable(&caches, &layout, flags, ctor.is_some()) {
            cache.get();
            cache.widen(object_size);
            info!("{}: merged into {}", name, cache.name());
            return Ok(cache.clone());
        }

        let cache = Arc::new(SlabCache::new(
            name,
            object_size,
            align,
            flags,
            ctor,
            &self.config,
            self.rng.next_u64(),
            self.blocks.clone(),
        )?);
        caches.push(cache.clone());
        Ok(cache)
    }

    /// Drop one reference to `cache`, destroying it with the last one.
    ///
    /// Fails with [`AllocError::InUse`] while the cache still has live
    /// objects; the reference is kept in that case.
    pub fn destroy_cache(&self, cache: Arc<SlabCache<B>>) -> AllocResult {
        self.release(cache, false)
    }

    /// Like [`destroy_cache`](Self::destroy_cache), but never fails on live
    /// objects. Their slabs are leaked.
    pub fn destroy_cache_forced(&self, cache: Arc<SlabCache<B>>) -> AllocResult {
        self.release(cache, true)
    }

    fn release(&self, cache: Arc<SlabCache<B>>, forced: bool) -> AllocResult {
        let mut caches = self.caches.lock();
        let pos = caches
            .iter()
            .position(|c| Arc::ptr_eq(c, &cache))
            .ok_or(AllocError::InvalidParam)?;
        if !cache.put() {
            return Ok(());
        }
        if let Err(err) = cache.shutdown(forced) {
            cache.get();
            return Err(err);
        }
        caches.remove(pos);
        Ok(())
    }

    /// Look a cache up by the name it was created with.
    pub fn find(&self, name: &str) -> Option<Arc<SlabCache<B>>> {
        self.caches
            .lock()
            .iter()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    /// Number of distinct caches; merged names count once.
    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the registered caches.
    pub fn caches(&self) -> Vec<Arc<SlabCache<B>>> {
        self.caches.lock().clone()
    }

    /// Release empty slabs of every cache.
    pub fn shrink_all(&self) -> usize {
        self.caches().iter().map(|cache| cache.shrink()).sum()
    }
}

impl<B: BlockAllocator> Drop for SlabRegistry<B> {
    fn drop(&mut self) {
        let caches = core::mem::take(&mut *self.caches.lock());
        for cache in caches {
            if cache.shutdown(false).is_err() {
                warn!("{}: still in use when the registry was dropped", cache.name());
            }
        }
    }
}

fn find_mergeable<'a, B: BlockAllocator>(
    caches: &'a [Arc<SlabCache<B>>],
    layout: &ObjectLayout,
    flags: SlabFlags,
    has_ctor: bool,
) -> Option<&'a Arc<SlabCache<B>>> {
    if has_ctor || flags.intersects(SlabFlags::NEVER_MERGE) {
        return None;
    }
    caches.iter().rev().find(|cache| {
        !cache.has_ctor()
            && !cache.is_dead()
            && !cache.flags().intersects(SlabFlags::NEVER_MERGE)
            && cache.flags() & SlabFlags::MERGE_SAME == flags & SlabFlags::MERGE_SAME
            && layout.size <= cache.size()
            && cache.size() & (layout.align - 1) == 0
            && cache.size() - layout.size < size_of::<usize>()
    })
}
