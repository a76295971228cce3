//! Concurrent stress tests
//!
//! Every cpu slot is driven by its own thread. Objects are handed between
//! threads so frees land on other cpus, and an ownership ledger checks that
//! no object is handed out twice or freed twice.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::thread;

use slub_allocator::{HeapBlockAllocator, SlabCache, SlabConfig, SlabFlags, SlabRegistry};

type Heap = HeapBlockAllocator<0x1000>;

const CPUS: usize = 4;
const OPS: usize = 20_000;

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

struct Ledger {
    live: Mutex<HashSet<usize>>,
    handoff: Mutex<Vec<usize>>,
}

impl Ledger {
    fn take(&self, addr: usize) {
        assert!(self.live.lock().unwrap().insert(addr), "{addr:#x} handed out twice");
    }

    fn release(&self, addr: usize) {
        assert!(self.live.lock().unwrap().remove(&addr), "{addr:#x} freed twice");
    }
}

fn free_checked(cache: &SlabCache<Heap>, ledger: &Ledger, cpu: usize, addr: usize) {
    let obj = NonNull::new(addr as *mut u8).unwrap();
    // The tag written at allocation must have survived.
    assert_eq!(unsafe { obj.as_ptr().cast::<usize>().read() }, addr);
    ledger.release(addr);
    unsafe { cache.free(cpu, obj).unwrap() };
}

fn run(flags: SlabFlags, size: usize) {
    let reg = SlabRegistry::new(
        SlabConfig::new(CPUS, 2).with_seed(11),
        Arc::new(Heap::new()),
    )
    .unwrap();
    let cache = reg.create_cache("stress", size, 16, flags, None).unwrap();
    let ledger = Arc::new(Ledger {
        live: Mutex::new(HashSet::new()),
        handoff: Mutex::new(Vec::new()),
    });

    let handles: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let cache = cache.clone();
            let ledger = ledger.clone();
            thread::spawn(move || {
                let mut rng = 0x9e37_79b9_7f4a_7c15 ^ (cpu as u64 + 1);
                let mut local = Vec::new();
                let (mut allocs, mut frees) = (0usize, 0usize);
                for _ in 0..OPS {
                    rng = xorshift(rng);
                    match rng % 4 {
                        0 | 1 => {
                            let obj = cache.alloc(cpu, None).unwrap();
                            let addr = obj.as_ptr() as usize;
                            assert_eq!(addr % 16, 0);
                            ledger.take(addr);
                            unsafe { obj.as_ptr().cast::<usize>().write(addr) };
                            allocs += 1;
                            if rng & 0x10 == 0 {
                                ledger.handoff.lock().unwrap().push(addr);
                            } else {
                                local.push(addr);
                            }
                        }
                        2 => {
                            if let Some(addr) = local.pop() {
                                free_checked(&cache, &ledger, cpu, addr);
                                frees += 1;
                            }
                        }
                        _ => {
                            let next = ledger.handoff.lock().unwrap().pop();
                            if let Some(addr) = next {
                                free_checked(&cache, &ledger, cpu, addr);
                                frees += 1;
                            }
                        }
                    }
                }
                for addr in local {
                    free_checked(&cache, &ledger, cpu, addr);
                    frees += 1;
                }
                (allocs, frees)
            })
        })
        .collect();

    let (mut allocs, mut frees) = (0, 0);
    for handle in handles {
        let (a, f) = handle.join().unwrap();
        allocs += a;
        frees += f;
    }
    let rest: Vec<usize> = std::mem::take(&mut *ledger.handoff.lock().unwrap());
    for addr in rest {
        free_checked(&cache, &ledger, 0, addr);
        frees += 1;
    }

    assert!(allocs > 0);
    assert_eq!(allocs, frees);
    assert!(ledger.live.lock().unwrap().is_empty());

    for cpu in 0..CPUS {
        cache.flush_cpu(cpu).unwrap();
    }
    cache.validate().unwrap();
    reg.destroy_cache(cache).unwrap();
    assert_eq!(reg.blocks().live_blocks(), 0);
}

#[test]
fn test_concurrent_plain() {
    run(SlabFlags::empty(), 96);
}

#[test]
fn test_concurrent_cpu_partial() {
    run(SlabFlags::CPU_PARTIAL, 96);
}

#[test]
fn test_concurrent_hardened_random() {
    run(
        SlabFlags::CPU_PARTIAL | SlabFlags::FREELIST_HARDENED | SlabFlags::FREELIST_RANDOM,
        200,
    );
}

#[test]
fn test_concurrent_red_zone() {
    run(SlabFlags::RED_ZONE | SlabFlags::CONSISTENCY_CHECKS, 64);
}
