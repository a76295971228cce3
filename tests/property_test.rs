//! Property tests: alignment and non-aliasing of live objects under random
//! allocate/free sequences.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use proptest::prelude::*;
use slub_allocator::{HeapBlockAllocator, SlabConfig, SlabFlags, SlabRegistry};

type Heap = HeapBlockAllocator<0x1000>;

#[derive(Debug, Clone)]
enum Operation {
    Alloc(usize),
    Free(usize, usize),
}

fn flags() -> impl Strategy<Value = SlabFlags> {
    (0u32..64).prop_map(|bits| {
        let mut flags = SlabFlags::empty();
        for (bit, flag) in [
            SlabFlags::HWCACHE_ALIGN,
            SlabFlags::RED_ZONE,
            SlabFlags::CONSISTENCY_CHECKS,
            SlabFlags::FREELIST_HARDENED,
            SlabFlags::FREELIST_RANDOM,
            SlabFlags::CPU_PARTIAL,
        ]
        .into_iter()
        .enumerate()
        {
            if bits & (1 << bit) != 0 {
                flags |= flag;
            }
        }
        flags
    })
}

proptest! {
    #[test]
    fn test_live_objects_are_aligned_and_disjoint(
        object_size in 1usize..600,
        align_shift in 0u32..9,
        flags in flags(),
        ops in proptest::collection::vec(
            prop_oneof![
                3 => (0usize..2).prop_map(Operation::Alloc),
                2 => (any::<usize>(), 0usize..2).prop_map(|(i, cpu)| Operation::Free(i, cpu)),
            ],
            1..300
        )
    ) {
        let align = 1usize << align_shift;
        let reg = SlabRegistry::new(SlabConfig::new(2, 1).with_seed(5), Arc::new(Heap::new())).unwrap();
        let cache = reg.create_cache("prop", object_size, align, flags, None).unwrap();
        prop_assert!(cache.size() >= object_size);
        prop_assert_eq!(cache.size() % cache.align(), 0);

        // start -> (end, tag)
        let mut live: BTreeMap<usize, (usize, u8)> = BTreeMap::new();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Operation::Alloc(cpu) => {
                    let obj = cache.alloc(cpu, None).unwrap();
                    let start = obj.as_ptr() as usize;
                    let end = start + object_size;
                    prop_assert_eq!(start % align, 0);
                    if let Some((_, &(prev_end, _))) = live.range(..start).next_back() {
                        prop_assert!(prev_end <= start);
                    }
                    if let Some((&next_start, _)) = live.range(start..).next() {
                        prop_assert!(end <= next_start);
                    }
                    let tag = step as u8;
                    unsafe { std::ptr::write_bytes(obj.as_ptr(), tag, object_size) };
                    live.insert(start, (end, tag));
                }
                Operation::Free(i, cpu) => {
                    if live.is_empty() {
                        continue;
                    }
                    let start = *live.keys().nth(i % live.len()).unwrap();
                    let (end, tag) = live.remove(&start).unwrap();
                    let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, end - start) };
                    prop_assert!(bytes.iter().all(|&b| b == tag));
                    unsafe { cache.free(cpu, NonNull::new(start as *mut u8).unwrap()).unwrap() };
                }
            }
        }

        for (start, _) in live {
            unsafe { cache.free(0, NonNull::new(start as *mut u8).unwrap()).unwrap() };
        }
        cache.flush_cpu(0).unwrap();
        cache.flush_cpu(1).unwrap();
        cache.validate().unwrap();
        reg.destroy_cache(cache).unwrap();
        prop_assert_eq!(reg.blocks().live_blocks(), 0);
    }
}
