//! Slab order selection.
//!
//! Picks the backing block order for a cache so that the space left over
//! after packing objects stays small, while keeping enough objects per slab
//! to amortize the slow paths.

use crate::{align_up, SlabConfig};

/// Orders must stay below this value.
pub const MAX_ORDER: u32 = 11;

/// Default upper bound for the preferred order (costly-order threshold).
pub const DEFAULT_MAX_ORDER: u32 = 3;

/// Object count limit per slab; also keeps indices clear of the empty marker.
pub const MAX_OBJS_PER_PAGE: usize = 32767;

/// Bounds for the node partial pool floor.
pub const MIN_PARTIAL: usize = 5;
pub const MAX_PARTIAL: usize = 10;

const OO_SHIFT: u32 = 16;
const OO_MASK: u32 = (1 << OO_SHIFT) - 1;

/// Order and object count packed into one word so both can be read atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderObjects(u32);

impl OrderObjects {
    pub fn new(page_size: usize, order: u32, size: usize) -> Self {
        let objects = order_objects(page_size, order, size);
        Self((order << OO_SHIFT) + objects as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn order(self) -> u32 {
        self.0 >> OO_SHIFT
    }

    pub const fn objects(self) -> usize {
        (self.0 & OO_MASK) as usize
    }
}

/// Number of `size` objects in a block of `order`.
pub fn order_objects(page_size: usize, order: u32, size: usize) -> usize {
    ((page_size << order) / size).min(MAX_OBJS_PER_PAGE)
}

/// Smallest order whose block holds `bytes`.
pub fn get_order(page_size: usize, bytes: usize) -> u32 {
    let pages = align_up(bytes.max(1), page_size) / page_size;
    pages.next_power_of_two().trailing_zeros()
}

/// Find last set bit, 1-based; `fls(0) == 0`.
fn fls(x: usize) -> u32 {
    usize::BITS - x.leading_zeros()
}

fn slab_order(
    page_size: usize,
    size: usize,
    min_objects: usize,
    min_order: u32,
    max_order: u32,
    fract_leftover: usize,
) -> u32 {
    if order_objects(page_size, min_order, size) >= MAX_OBJS_PER_PAGE {
        return get_order(page_size, size * MAX_OBJS_PER_PAGE).saturating_sub(1);
    }

    let mut order = min_order.max(get_order(page_size, min_objects * size));
    while order <= max_order {
        let slab_size = page_size << order;
        let rem = slab_size % size;
        if rem <= slab_size / fract_leftover {
            break;
        }
        order += 1;
    }
    order
}

/// Choose the preferred order for objects of `size` bytes.
///
/// Returns `None` when even the largest order cannot hold one object.
pub fn calculate_order(page_size: usize, size: usize, config: &SlabConfig) -> Option<u32> {
    let max_order = config.max_order;
    let min_order = config.min_order;

    let mut min_objects = if config.min_objects == 0 {
        4 * (fls(config.nr_cpus) as usize + 1)
    } else {
        config.min_objects
    };
    let max_objects = order_objects(page_size, max_order, size);
    min_objects = min_objects.min(max_objects);

    // Accept less waste first, then trade it for fewer objects per slab.
    while min_objects > 1 {
        let mut fraction = 16;
        while fraction >= 4 {
            let order = slab_order(page_size, size, min_objects, min_order, max_order, fraction);
            if order <= max_order {
                return Some(order);
            }
            fraction /= 2;
        }
        min_objects -= 1;
    }

    // A single object per slab, first within the configured bound.
    let order = slab_order(page_size, size, 1, min_order, max_order, 1);
    if order <= max_order {
        return Some(order);
    }

    // Then anything the backing allocator can hand out.
    let order = slab_order(page_size, size, 1, min_order, MAX_ORDER - 1, 1);
    if order < MAX_ORDER && order_objects(page_size, order, size) >= 1 {
        return Some(order);
    }
    None
}

/// Default node partial floor for objects of `size` bytes.
pub fn default_min_partial(size: usize) -> usize {
    let min = size.max(1).ilog2() as usize / 2;
    min.clamp(MIN_PARTIAL, MAX_PARTIAL)
}

/// Default per-cpu partial object budget for objects of `size` bytes.
pub fn default_cpu_partial(page_size: usize, size: usize) -> usize {
    if size >= page_size {
        2
    } else if size >= 1024 {
        6
    } else if size >= 256 {
        13
    } else {
        30
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn test_pack_unpack() {
        let oo = OrderObjects::new(PAGE, 2, 128);
        assert_eq!(oo.order(), 2);
        assert_eq!(oo.objects(), 128);
        assert_eq!(OrderObjects::from_raw(oo.raw()), oo);
    }

    #[test]
    fn test_get_order() {
        assert_eq!(get_order(PAGE, 1), 0);
        assert_eq!(get_order(PAGE, PAGE), 0);
        assert_eq!(get_order(PAGE, PAGE + 1), 1);
        assert_eq!(get_order(PAGE, 3 * PAGE), 2);
    }

    #[test]
    fn test_small_objects_fit_one_page() {
        let config = SlabConfig::new(4, 1);
        assert_eq!(calculate_order(PAGE, 64, &config), Some(0));
        assert_eq!(order_objects(PAGE, 0, 64), 64);
        assert_eq!(calculate_order(PAGE, 8, &config), Some(0));
    }

    #[test]
    fn test_waste_drives_order_up() {
        // 700 bytes leaves 596 bytes over in one page but far less in two.
        let config = SlabConfig::new(1, 1).with_min_objects(2);
        let order = calculate_order(PAGE, 700, &config).unwrap();
        let slab_size = PAGE << order;
        assert!(slab_size % 700 <= slab_size / 4);
        assert!(order <= DEFAULT_MAX_ORDER);
    }

    #[test]
    fn test_large_objects_exceed_max_order() {
        let config = SlabConfig::new(1, 1);
        let order = calculate_order(PAGE, 64 * 1024, &config).unwrap();
        assert_eq!(order, 4);
        assert!(calculate_order(PAGE, PAGE << MAX_ORDER, &config).is_none());
    }

    #[test]
    fn test_default_tunables() {
        assert_eq!(default_min_partial(8), MIN_PARTIAL);
        assert_eq!(default_min_partial(1 << 16), 8);
        assert_eq!(default_min_partial(1 << 30), MAX_PARTIAL);
        assert_eq!(default_cpu_partial(PAGE, 64), 30);
        assert_eq!(default_cpu_partial(PAGE, 512), 13);
        assert_eq!(default_cpu_partial(PAGE, 2048), 6);
        assert_eq!(default_cpu_partial(PAGE, PAGE), 2);
    }
}
