//! Object layout inside a slab.
//!
//! ```text
//! |<---------------------------- size ---------------------------->|
//! | left red zone | payload (object_size) | right red zone | fp | pad |
//!                 ^ object pointer        ^ object_size    ^ inuse
//! ```
//!
//! The free pointer lives at `object + offset`: inside the payload when the
//! cache has no constructor, after `inuse` otherwise.

use core::mem::size_of;

use super::SlabFlags;
use crate::{align_up, AllocError, AllocResult};

const WORD: usize = size_of::<usize>();

/// Minimum object alignment.
pub const ARCH_SLAB_MINALIGN: usize = 8;

/// Pattern painted into red zones.
pub const RED_INACTIVE: u8 = 0xbb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Payload size requested by the cache creator.
    pub object_size: usize,
    /// Stride between objects, including metadata and padding.
    pub size: usize,
    pub align: usize,
    /// Free pointer offset from the object pointer.
    pub offset: usize,
    /// Offset of trailing metadata from the object pointer.
    pub inuse: usize,
    /// Bytes reserved in front of every object.
    pub red_left_pad: usize,
}

fn calculate_alignment(flags: SlabFlags, align: usize, object_size: usize, cache_line: usize) -> usize {
    let mut align = align;
    if flags.contains(SlabFlags::HWCACHE_ALIGN) {
        let mut ralign = cache_line;
        while object_size <= ralign / 2 {
            ralign /= 2;
        }
        align = align.max(ralign);
    }
    align_up(align.max(ARCH_SLAB_MINALIGN), WORD)
}

impl ObjectLayout {
    /// Compute the layout for `object_size` bytes at `align`.
    ///
    /// An `align` of zero selects the minimum alignment.
    pub fn new(
        object_size: usize,
        align: usize,
        flags: SlabFlags,
        has_ctor: bool,
        cache_line: usize,
        page_size: usize,
    ) -> AllocResult<Self> {
        if object_size == 0 || (align != 0 && !align.is_power_of_two()) || align > page_size {
            return Err(AllocError::InvalidParam);
        }
        let align = calculate_alignment(flags, align, object_size, cache_line);

        let mut size = object_size
            .checked_add(WORD - 1)
            .ok_or(AllocError::InvalidParam)?
            & !(WORD - 1);
        if flags.contains(SlabFlags::RED_ZONE) && size == object_size {
            size += WORD;
        }
        let inuse = size;

        let mut offset = 0;
        if has_ctor {
            offset = size;
            size += WORD;
        }

        let mut red_left_pad = 0;
        if flags.contains(SlabFlags::RED_ZONE) {
            red_left_pad = align_up(WORD, align);
            size += red_left_pad;
        }

        let size = size
            .checked_add(align - 1)
            .ok_or(AllocError::InvalidParam)?
            & !(align - 1);

        Ok(Self {
            object_size,
            size,
            align,
            offset,
            inuse,
            red_left_pad,
        })
    }

    /// Object pointer of the `index`-th object of a slab at `base`.
    #[inline]
    pub fn object_at(&self, base: usize, index: usize) -> usize {
        base + index * self.size + self.red_left_pad
    }

    /// Address of the free pointer stored in `object`.
    #[inline]
    pub fn freeptr_addr(&self, object: usize) -> usize {
        object + self.offset
    }

    /// Left red zone, right red zone.
    pub(crate) fn red_zones(&self, object: usize) -> [(usize, usize); 2] {
        [
            (object - self.red_left_pad, self.red_left_pad),
            (object + self.object_size, self.inuse - self.object_size),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn layout(object_size: usize, align: usize, flags: SlabFlags, ctor: bool) -> ObjectLayout {
        ObjectLayout::new(object_size, align, flags, ctor, 64, PAGE).unwrap()
    }

    #[test]
    fn test_plain_layout() {
        let l = layout(64, 8, SlabFlags::empty(), false);
        assert_eq!(l.size, 64);
        assert_eq!(l.offset, 0);
        assert_eq!(l.red_left_pad, 0);
        assert_eq!(l.object_at(0x1000, 3), 0x1000 + 192);
    }

    #[test]
    fn test_align_larger_than_object() {
        let l = layout(8, 64, SlabFlags::empty(), false);
        assert_eq!(l.size, 64);
        assert_eq!(l.align, 64);
        assert_eq!(l.size % l.align, 0);
    }

    #[test]
    fn test_small_object_rounds_to_word() {
        let l = layout(3, 0, SlabFlags::empty(), false);
        assert_eq!(l.size, 8);
        assert_eq!(l.align, ARCH_SLAB_MINALIGN);
    }

    #[test]
    fn test_ctor_moves_free_pointer_out() {
        let l = layout(24, 8, SlabFlags::empty(), true);
        assert_eq!(l.offset, 24);
        assert_eq!(l.size, 32);
        assert!(l.offset < l.size);
    }

    #[test]
    fn test_red_zone_layout() {
        let l = layout(64, 16, SlabFlags::RED_ZONE, false);
        // One word of right red zone, one aligned word in front.
        assert_eq!(l.inuse, 72);
        assert_eq!(l.red_left_pad, 16);
        assert_eq!(l.size, 96);
        assert_eq!(l.object_at(0, 0) % 16, 0);
        let [(left, left_len), (right, right_len)] = l.red_zones(l.object_at(0, 1));
        assert_eq!(left, 96);
        assert_eq!(left_len, 16);
        assert_eq!(right, 96 + 16 + 64);
        assert_eq!(right_len, 8);
    }

    #[test]
    fn test_hwcache_align() {
        assert_eq!(layout(100, 0, SlabFlags::HWCACHE_ALIGN, false).align, 64);
        // Small objects share a line instead of wasting it.
        assert_eq!(layout(20, 0, SlabFlags::HWCACHE_ALIGN, false).align, 32);
    }

    #[test]
    fn test_invalid_params() {
        let new = |size, align| ObjectLayout::new(size, align, SlabFlags::empty(), false, 64, PAGE);
        assert_eq!(new(0, 8), Err(AllocError::InvalidParam));
        assert_eq!(new(16, 24), Err(AllocError::InvalidParam));
        assert_eq!(new(16, 2 * PAGE), Err(AllocError::InvalidParam));
    }
}
