//! Freelist hardening helpers.
//!
//! Free pointer obfuscation, freelist permutation and red zone painting.
//! None of these change the allocation state machine, only how object
//! memory is laid out and how stored pointers are decoded.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::layout::{ObjectLayout, RED_INACTIVE};

/// Lock-free xorshift64 generator.
pub(crate) struct SlabRng {
    state: AtomicU64,
}

impl SlabRng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves the all-zero state
        Self {
            state: AtomicU64::new(if seed == 0 { 0x2545_f491_4f6c_dd1d } else { seed }),
        }
    }

    fn step(mut x: u64) -> u64 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    }

    pub fn next_u64(&self) -> u64 {
        let prev = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(Self::step(x)))
            .unwrap_or_else(|x| x);
        Self::step(prev)
    }

    /// Uniform-enough value in `0..bound`.
    pub fn below(&self, bound: usize) -> usize {
        (self.next_u64() % bound.max(1) as u64) as usize
    }
}

/// How next-free pointers are stored inside free objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreePointerCodec {
    Plain,
    /// `ptr ^ secret ^ slot address`
    Hardened { secret: usize },
}

impl FreePointerCodec {
    #[inline]
    pub fn encode(self, ptr: usize, ptr_addr: usize) -> usize {
        match self {
            Self::Plain => ptr,
            Self::Hardened { secret } => ptr ^ secret ^ ptr_addr,
        }
    }

    #[inline]
    pub fn decode(self, stored: usize, ptr_addr: usize) -> usize {
        // The transform is an involution.
        self.encode(stored, ptr_addr)
    }
}

/// Random permutation of object indices for a slab of `count` objects.
pub(crate) fn random_sequence(count: usize, rng: &SlabRng) -> Box<[u16]> {
    let mut seq: Vec<u16> = (0..count as u16).collect();
    // Fisher-Yates
    for i in (1..count).rev() {
        let j = rng.below(i + 1);
        seq.swap(i, j);
    }
    seq.into_boxed_slice()
}

/// Iterate a permutation built for `seq.len()` objects from a random start,
/// keeping only indices that exist in a slab of `objects`.
pub(crate) fn shuffled_indices(
    seq: &[u16],
    start: usize,
    objects: usize,
) -> impl Iterator<Item = usize> + '_ {
    let len = seq.len();
    (0..len)
        .map(move |i| seq[(start + i) % len] as usize)
        .filter(move |&idx| idx < objects)
}

/// Paint both red zones of `object`.
///
/// # Safety
///
/// `object` must be an object pointer of a slab laid out with `layout`.
pub(crate) unsafe fn paint_red_zones(layout: &ObjectLayout, object: usize) {
    for (start, len) in layout.red_zones(object) {
        core::ptr::write_bytes(start as *mut u8, RED_INACTIVE, len);
    }
}

/// Return the first damaged red zone byte, if any.
///
/// # Safety
///
/// `object` must be an object pointer of a slab laid out with `layout`.
pub(crate) unsafe fn check_red_zones(layout: &ObjectLayout, object: usize) -> Option<usize> {
    for (start, len) in layout.red_zones(object) {
        let zone = core::slice::from_raw_parts(start as *const u8, len);
        if let Some(pos) = zone.iter().position(|&b| b != RED_INACTIVE) {
            return Some(start + pos);
        }
    }
    None
}
