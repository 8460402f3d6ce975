//! Multi-threaded stress: claim exclusivity, census settling.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;

use qba_lib::NOT_FOUND;

use crate::director::Qba;
use crate::registry::{Registry, words_for};

#[test]
fn parallel_allocations_are_distinct() {
    let qba = Qba::create_default(false).unwrap();
    let threads = 8;
    let per_thread = 200;
    let mut all: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    let mut mine = Vec::with_capacity(per_thread);
                    for _ in 0..per_thread {
                        let addr = qba.allocate(64);
                        assert_ne!(addr, 0);
                        mine.push(addr);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });
    all.sort_unstable();
    all.windows(2).for_each(|pair| assert_ne!(pair[0], pair[1]));
    for &addr in &all {
        qba.deallocate(addr);
    }
    assert_eq!(qba.snapshot().live_at(6), 0);
    qba.destroy(false);
}

#[test]
fn allocate_free_churn_settles_to_zero() {
    let qba = Qba::create_default(false).unwrap();
    thread::scope(|scope| {
        for t in 0..8u64 {
            let qba = &qba;
            scope.spawn(move || {
                let mut state = t.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
                let mut live: Vec<u64> = Vec::new();
                for _ in 0..600 {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    if state & 1 == 0 || live.is_empty() {
                        let size = 1 + (state >> 8) % 4096;
                        let addr = qba.allocate(size);
                        assert_ne!(addr, 0);
                        unsafe { (addr as usize as *mut u64).write(state) };
                        live.push(addr);
                    } else {
                        let pick = ((state >> 16) as usize) % live.len();
                        qba.deallocate(live.swap_remove(pick));
                    }
                }
                for addr in live {
                    qba.deallocate(addr);
                }
            });
        }
    });
    let stats = qba.snapshot();
    for order in 3..=48 {
        assert_eq!(stats.live_at(order), 0, "order {} leaked", order);
    }
    qba.destroy(false);
}

#[test]
fn run_claims_never_overlap_under_contention() {
    let words: Vec<AtomicU64> = (0..words_for(1024)).map(|_| AtomicU64::new(0)).collect();
    let registry = Registry::new(words.as_ptr() as *mut AtomicU64, 1024);
    let owners: Vec<AtomicU8> = (0..1024).map(|_| AtomicU8::new(0)).collect();
    thread::scope(|scope| {
        for _ in 0..4 {
            let registry = &registry;
            let owners = &owners;
            scope.spawn(move || {
                for _ in 0..500 {
                    let start = registry.find_free_run(5);
                    if start == NOT_FOUND {
                        continue;
                    }
                    for i in start..start + 5 {
                        assert_eq!(
                            owners[i as usize].fetch_add(1, Ordering::SeqCst),
                            0,
                            "bit {} double-claimed",
                            i
                        );
                    }
                    for i in start..start + 5 {
                        owners[i as usize].fetch_sub(1, Ordering::SeqCst);
                    }
                    registry.free_run(start, 5);
                }
            });
        }
    });
    assert_eq!(registry.count(), 0);
}

#[test]
fn single_bit_claims_never_overlap_under_contention() {
    let words: Vec<AtomicU64> = (0..words_for(256)).map(|_| AtomicU64::new(0)).collect();
    let registry = Registry::new(words.as_ptr() as *mut AtomicU64, 256);
    let owners: Vec<AtomicU8> = (0..256).map(|_| AtomicU8::new(0)).collect();
    thread::scope(|scope| {
        for _ in 0..8 {
            let registry = &registry;
            let owners = &owners;
            scope.spawn(move || {
                for _ in 0..2000 {
                    let bit = registry.find_free();
                    if bit == NOT_FOUND {
                        continue;
                    }
                    assert_eq!(owners[bit as usize].fetch_add(1, Ordering::SeqCst), 0);
                    owners[bit as usize].fetch_sub(1, Ordering::SeqCst);
                    registry.free(bit);
                }
            });
        }
    });
    assert_eq!(registry.count(), 0);
}
