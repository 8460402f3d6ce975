//! Director surface tests: allocation contracts, recycling, realloc,
//! stats, walks, bulk and fit operations.

use core::ptr;

use qba_lib::round_up_pow2;

use crate::config::DirectorConfig;
use crate::constants::ORDER_COUNT;
use crate::director::Qba;
use crate::error::QbaError;

fn fill(addr: u64, value: u8, len: usize) {
    unsafe { ptr::write_bytes(addr as usize as *mut u8, value, len) };
}

fn read(addr: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    unsafe {
        ptr::copy_nonoverlapping(addr as usize as *const u8, out.as_mut_ptr(), len);
    }
    out
}

#[test]
fn version_is_packed_and_printable() {
    let version = crate::version();
    assert_eq!(version >> 16, crate::VERSION_RELEASE);
    assert!(crate::version_string().starts_with("QBA "));
}

#[test]
fn invalid_configurations_are_rejected_up_front() {
    let mut config = DirectorConfig::default();
    config.small_partitions = 16385;
    assert!(matches!(
        Qba::create(&config),
        Err(QbaError::InvalidConfiguration { field: "small_partitions", .. })
    ));

    let mut config = DirectorConfig::default();
    config.side_data_size = 65;
    assert!(Qba::create_size(&config).is_err());

    // Shared mode requires a nonzero, region-aligned address.
    let mut config = DirectorConfig::default();
    config.link_name = Some("qba-misconfigured".into());
    assert!(matches!(
        Qba::create(&config),
        Err(QbaError::InvalidConfiguration { field: "address", .. })
    ));
}

#[test]
fn create_size_covers_regions_and_metadata() {
    let size = Qba::create_size(&DirectorConfig::default()).unwrap();
    let quantum = (32u64 << 17) + (16 << 24) + (8 << 26);
    assert!(size > quantum);
    assert_eq!(size % crate::os::page_size(), 0);
}

#[test]
fn small_allocation_recycles_and_secure_zeroes() {
    // S1: free then same-size allocate returns the same quantum, zeroed.
    let qba = Qba::create_default(true).unwrap();
    let a = qba.allocate(8);
    assert_ne!(a, 0);
    fill(a, 0xFF, 8);
    qba.deallocate(a);
    let b = qba.allocate(8);
    assert_eq!(b, a);
    assert_eq!(read(b, 8), vec![0u8; 8]);
    qba.deallocate(b);
    qba.destroy(false);
}

#[test]
fn sizes_round_to_powers_of_two_and_align() {
    let qba = Qba::create_default(false).unwrap();
    for request in [1u64, 8, 9, 100, 1024, 5000, 1 << 17, (1 << 20) + 1] {
        let addr = qba.allocate(request);
        assert_ne!(addr, 0, "allocate({})", request);
        let size = qba.size(addr);
        assert_eq!(size, round_up_pow2(request.max(8)));
        assert!(size >= request);
        assert_eq!(addr % size, 0, "allocate({}) not naturally aligned", request);
        qba.deallocate(addr);
    }
    qba.destroy(false);
}

#[test]
fn every_order_band_serves_requests() {
    let qba = Qba::create_default(false).unwrap();
    // Small, medium, large quantum bands, then a slab.
    for size in [8u64, 1 << 12, 1 << 19, 1 << 26, 1 << 27] {
        let addr = qba.allocate(size);
        assert_ne!(addr, 0, "allocate({:#x})", size);
        assert_eq!(qba.size(addr), size);
        qba.deallocate(addr);
    }
    assert_eq!(qba.allocate(0), 0);
    assert_eq!(qba.allocate((1 << 48) + 1), 0);
    qba.destroy(false);
}

#[test]
fn slab_reservations_recycle() {
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(1 << 27);
    assert_ne!(a, 0);
    assert_eq!(a % (1 << 26), 0);
    qba.deallocate(a);
    let b = qba.allocate(1 << 27);
    assert_eq!(b, a);
    qba.deallocate(b);
    qba.destroy(false);
}

#[test]
fn realloc_grow_moves_and_preserves_content() {
    // S2.
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(8);
    fill(a, 0xFF, 8);
    let b = qba.reallocate(a, 9);
    assert_ne!(b, 0);
    assert_ne!(b, a);
    assert!(qba.size(b) >= 9);
    assert_eq!(read(b, 8), vec![0xFF; 8]);
    qba.deallocate(b);
    qba.destroy(false);
}

#[test]
fn realloc_shrink_within_order_stays_put() {
    // S3, and the null-address case.
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(8);
    assert_eq!(qba.reallocate(a, 7), a);
    qba.deallocate(a);

    let fresh = qba.reallocate(0, 32);
    assert_ne!(fresh, 0);
    assert_eq!(qba.size(fresh), 32);
    qba.deallocate(fresh);
    qba.destroy(false);
}

#[test]
fn realloc_to_smaller_order_moves() {
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(1024);
    fill(a, 0x5A, 16);
    let b = qba.reallocate(a, 16);
    assert_ne!(b, 0);
    assert_ne!(b, a);
    assert_eq!(qba.size(b), 16);
    assert_eq!(read(b, 16), vec![0x5A; 16]);
    // The old block was released.
    assert_eq!(qba.size(a), 0);
    qba.deallocate(b);
    qba.destroy(false);
}

#[test]
fn base_recovers_from_any_interior_pointer() {
    // S4.
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(1024);
    for k in 0..1024 {
        assert_eq!(qba.base(a + k), a);
    }
    qba.deallocate(a);
    qba.destroy(false);
}

#[test]
fn bulk_contiguous_is_all_or_nothing_and_spaced() {
    // S5.
    let qba = Qba::create_default(false).unwrap();
    let mut out = [0u64; 8];
    assert_eq!(qba.allocate_bulk(16, &mut out, true), 8);
    for i in 1..8 {
        assert_eq!(out[i], out[i - 1] + 16);
    }
    qba.deallocate_bulk(&out);
    qba.destroy(false);
}

#[test]
fn bulk_sparse_fills_and_releases() {
    let qba = Qba::create_default(false).unwrap();
    let mut out = [0u64; 37];
    assert_eq!(qba.allocate_bulk(64, &mut out, false), 37);
    let mut sorted = out;
    sorted.sort_unstable();
    sorted.windows(2).for_each(|pair| assert_ne!(pair[0], pair[1]));
    qba.deallocate_bulk(&out);
    let stats = qba.snapshot();
    assert_eq!(stats.live_at(6), 0);
    qba.destroy(false);
}

#[test]
fn stats_census_round_trips() {
    // S6 plus the summary slots.
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(1024);
    let b = qba.allocate(1024);
    let mut counts = [0u64; ORDER_COUNT];
    let mut sizes = [0u64; ORDER_COUNT];
    qba.stats(&mut counts, &mut sizes);
    assert_eq!(counts[10], 2);
    assert_eq!(sizes[10], 2048);
    assert!(sizes[1] > 0);
    assert_eq!(counts[0], counts[1..].iter().sum::<u64>());
    assert_eq!(sizes[0], sizes[1..].iter().sum::<u64>());

    qba.deallocate(a);
    qba.deallocate(b);
    qba.stats(&mut counts, &mut sizes);
    assert_eq!(counts[10], 0);
    assert!(sizes[1] > 0);
    qba.destroy(false);
}

#[test]
fn walk_enumerates_each_live_allocation_once() {
    // S7: three sizes across three components.
    let qba = Qba::create_default(false).unwrap();
    let expected = [qba.allocate(8), qba.allocate(2048), qba.allocate(1 << 20)];
    let mut seen = Vec::new();
    let mut cursor = qba.next(0);
    while cursor != 0 {
        seen.push(cursor);
        cursor = qba.next(cursor);
    }
    assert_eq!(seen.len(), 3);
    for addr in expected {
        assert!(seen.contains(&addr));
        qba.deallocate(addr);
    }
    assert_eq!(qba.next(0), 0);
    qba.destroy(false);
}

#[test]
fn unknown_addresses_are_inert() {
    // S8.
    let qba = Qba::create_default(false).unwrap();
    qba.deallocate(0);
    qba.deallocate(0x1000);
    assert_eq!(qba.size(0), 0);
    assert_eq!(qba.base(0), 0);
    assert_eq!(qba.side_data(0), 0);
    assert_eq!(qba.next(0x1000), 0);
    assert_eq!(qba.reallocate(0x1000, 64), 0);
    qba.destroy(false);
}

#[test]
fn failed_realloc_leaves_the_block_live() {
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(64);
    fill(a, 0x77, 64);
    // Larger than any serviceable request: allocation fails, `a` stays.
    assert_eq!(qba.reallocate(a, (1 << 48) + 1), 0);
    assert_eq!(qba.size(a), 64);
    assert_eq!(read(a, 64), vec![0x77; 64]);
    qba.deallocate(a);
    qba.destroy(false);
}

#[test]
fn clear_zeroes_a_live_block() {
    let qba = Qba::create_default(false).unwrap();
    let a = qba.allocate(4096);
    fill(a, 0xA5, 4096);
    qba.clear(a);
    assert_eq!(read(a, 4096), vec![0u8; 4096]);
    qba.deallocate(a);
    qba.destroy(false);
}

#[test]
fn allocate_count_hands_out_adjacent_blocks() {
    let qba = Qba::create_default(false).unwrap();
    let base = qba.allocate_count(32, 5);
    assert_ne!(base, 0);
    for i in 0..5u64 {
        assert_eq!(qba.size(base + i * 32), 32);
    }
    qba.deallocate_count(base, 32, 5);
    assert_eq!(qba.size(base), 0);
    // Non-power-of-two sizes are rejected before any side effect.
    assert_eq!(qba.allocate_count(48, 2), 0);
    qba.destroy(false);
}

#[test]
fn fit_allocations_split_and_rejoin() {
    let qba = Qba::create_default(false).unwrap();
    // 40 bytes at degree 2: three 16-byte blocks instead of one 64.
    let addr = qba.allocate_fit(40, 2);
    assert_ne!(addr, 0);
    assert_eq!(qba.size(addr), 16);
    assert_eq!(qba.size(addr + 16), 16);
    assert_eq!(qba.size(addr + 32), 16);
    qba.deallocate_fit(addr, 40, 2);
    let stats = qba.snapshot();
    assert_eq!(stats.live_at(4), 0);

    // An exact power of two falls back to a single block.
    let exact = qba.allocate_fit(64, 2);
    assert_eq!(qba.size(exact), 64);
    qba.deallocate_fit(exact, 64, 2);

    assert_eq!(qba.allocate_fit(40, 0), 0);
    assert_eq!(qba.allocate_fit(40, 5), 0);
    qba.destroy(false);
}

#[test]
fn side_data_rides_along_with_allocations() {
    let mut config = DirectorConfig::default();
    config.side_data_size = 16;
    let qba = Qba::create(&config).unwrap();
    let a = qba.allocate(64);
    let b = qba.allocate(64);
    let sa = qba.side_data(a);
    let sb = qba.side_data(b);
    assert_ne!(sa, 0);
    assert_ne!(sb, 0);
    assert_ne!(sa, sb);
    fill(sa, 0xEE, 16);
    assert_eq!(read(sa, 16), vec![0xEE; 16]);
    qba.deallocate(a);
    assert_eq!(qba.side_data(a), 0);
    qba.deallocate(b);
    qba.destroy(false);
}

#[test]
fn user_reference_is_a_cas_slot() {
    let qba = Qba::create_default(false).unwrap();
    assert_eq!(qba.reference(), 0);
    assert!(qba.set_reference(0, 0xDEAD));
    assert!(!qba.set_reference(0, 0xBEEF));
    assert!(qba.set_reference(0xDEAD, 0xBEEF));
    assert_eq!(qba.reference(), 0xBEEF);
    qba.destroy(false);
}

#[test]
fn exhausted_order_repurposes_an_empty_partition() {
    // Fill every small-region slot at one order, drain them, then ask
    // for a different order: the allocator must retool a drained slot
    // rather than fail.
    let qba = Qba::create_default(false).unwrap();
    let per_partition = 1usize << (17 - 10);
    let slots = 32;
    let mut blocks = Vec::with_capacity(per_partition * slots);
    for _ in 0..per_partition * slots {
        let addr = qba.allocate(1024);
        assert_ne!(addr, 0);
        blocks.push(addr);
    }
    // Every slot now serves order 10; order 3 has nowhere to go but a
    // repurposed slot.
    for &addr in &blocks {
        qba.deallocate(addr);
    }
    let tiny = qba.allocate(8);
    assert_ne!(tiny, 0);
    assert_eq!(qba.size(tiny), 8);
    let stats = qba.snapshot();
    assert_eq!(stats.live_at(3), 1);
    assert_eq!(stats.live_at(10), 0);
    qba.deallocate(tiny);
    qba.destroy(false);
}

#[cfg(target_os = "linux")]
#[test]
fn shared_backing_survives_detach_and_reattach() {
    use crate::constants::REGION_ALIGNMENT;
    use crate::os;

    let name = format!("qba-selftest-{}", std::process::id());
    let mut config = DirectorConfig::default();
    config.link_name = Some(name.clone());

    // Find an address range the OS is happy with, then hand it back and
    // ask for the shared mapping there.
    let size = Qba::create_size(&config).unwrap();
    let probe = os::reserve_aligned(size, REGION_ALIGNMENT).unwrap();
    os::release(probe, size);
    config.address = probe;

    let creator = Qba::create(&config).unwrap();
    assert!(creator.director().is_shared());
    let a = creator.allocate(64);
    assert_ne!(a, 0);
    fill(a, 0xAB, 64);
    creator.destroy(false);

    // The named object persists: a second create attaches and sees the
    // same metadata and contents.
    let attached = Qba::create(&config).unwrap();
    assert_eq!(attached.size(a), 64);
    assert_eq!(read(a, 64), vec![0xAB; 64]);
    attached.deallocate(a);
    attached.destroy(true);
}
