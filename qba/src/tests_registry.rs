//! Registry unit tests: claim ordering, run search, hint behavior.

use core::sync::atomic::AtomicU64;

use qba_lib::NOT_FOUND;

use crate::registry::{Registry, words_for};

fn backing(bits: u32) -> Vec<AtomicU64> {
    (0..words_for(bits)).map(|_| AtomicU64::new(0)).collect()
}

fn registry_over(words: &[AtomicU64], bits: u32) -> Registry {
    Registry::new(words.as_ptr() as *mut AtomicU64, bits)
}

#[test]
fn set_and_clear_report_transitions() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    assert!(registry.set(7));
    assert!(!registry.set(7));
    assert!(registry.is_set(7));
    assert!(registry.clear(7));
    assert!(!registry.clear(7));
    assert!(!registry.is_set(7));
}

#[test]
fn find_free_claims_ascending() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    for expected in 0..128 {
        assert_eq!(registry.find_free(), expected);
    }
    assert_eq!(registry.find_free(), NOT_FOUND);
}

#[test]
fn find_free_reuses_lowest_freed_bit() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    for _ in 0..100 {
        registry.find_free();
    }
    registry.free(3);
    registry.free(77);
    assert_eq!(registry.find_free(), 3);
    assert_eq!(registry.find_free(), 77);
    assert_eq!(registry.find_free(), 100);
}

#[test]
fn bits_past_the_end_are_never_free() {
    let words = backing(10);
    let registry = registry_over(&words, 10);
    for expected in 0..10 {
        assert_eq!(registry.find_free(), expected);
    }
    assert_eq!(registry.find_free(), NOT_FOUND);
    assert_eq!(registry.count(), 10);
}

#[test]
fn run_claim_inside_one_word() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    assert_eq!(registry.find_free_run(5), 0);
    assert_eq!(registry.find_free_run(3), 5);
    for i in 0..8 {
        assert!(registry.is_set(i));
    }
    registry.free_run(0, 5);
    assert_eq!(registry.find_free_run(4), 0);
}

#[test]
fn run_claim_across_word_boundary() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    // Occupy word 0 except its top two bits.
    for i in 0..62 {
        assert!(registry.set(i));
    }
    let start = registry.find_free_run(6);
    assert_eq!(start, 62);
    for i in 62..68 {
        assert!(registry.is_set(i));
    }
    registry.free_run(62, 6);
    assert!(!registry.is_set(64));
}

#[test]
fn run_claim_wider_than_a_word() {
    let words = backing(256);
    let registry = registry_over(&words, 256);
    assert!(registry.set(5));
    let start = registry.find_free_run(130);
    assert_eq!(start, 6);
    assert_eq!(registry.count(), 131);
    registry.free_run(6, 130);
    assert_eq!(registry.count(), 1);
}

#[test]
fn run_of_the_whole_map() {
    let words = backing(256);
    let registry = registry_over(&words, 256);
    assert_eq!(registry.find_free_run(256), 0);
    assert_eq!(registry.count(), 256);
    assert_eq!(registry.find_free(), NOT_FOUND);
}

#[test]
fn only_fitting_gap_is_found_once() {
    let words = backing(64);
    let registry = registry_over(&words, 64);
    for i in 0..64 {
        if !(20..25).contains(&i) {
            assert!(registry.set(i));
        }
    }
    assert_eq!(registry.find_free_run(5), 20);
    assert_eq!(registry.find_free_run(5), NOT_FOUND);
}

#[test]
fn oversized_run_is_not_found() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    assert_eq!(registry.find_free_run(129), NOT_FOUND);
    assert_eq!(registry.count(), 0);
}

#[test]
fn claim_word_takes_everything_free() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    assert!(registry.set(1));
    assert!(registry.set(60));
    let mask = registry.claim_word(0);
    assert_eq!(mask, !((1u64 << 1) | (1u64 << 60)));
    assert_eq!(registry.count(), 64);
    // Give back a surplus tail the caller did not need.
    let surplus = mask & (!0u64 << 32);
    registry.clear_mask(0, surplus);
    assert_eq!(registry.count(), 64 - surplus.count_ones());
    assert_eq!(registry.find_free(), 32);
}

#[test]
fn free_mask_releases_a_word_group() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    for i in 0..6 {
        assert_eq!(registry.find_free(), i);
    }
    registry.free_mask(0, 0b1110);
    assert_eq!(registry.find_free(), 1);
    assert_eq!(registry.find_free(), 2);
    assert_eq!(registry.find_free(), 3);
    assert_eq!(registry.find_free(), 6);
}

#[test]
fn next_set_walks_set_bits() {
    let words = backing(192);
    let registry = registry_over(&words, 192);
    for i in [0u32, 63, 64, 130] {
        assert!(registry.set(i));
    }
    assert_eq!(registry.next_set(0), 0);
    assert_eq!(registry.next_set(1), 63);
    assert_eq!(registry.next_set(64), 64);
    assert_eq!(registry.next_set(65), 130);
    assert_eq!(registry.next_set(131), NOT_FOUND);
}

#[test]
fn reset_limited_caps_the_free_range() {
    let words = backing(256);
    let registry = registry_over(&words, 256);
    registry.reset_limited(100);
    for expected in 0..100 {
        assert_eq!(registry.find_free(), expected);
    }
    assert_eq!(registry.find_free(), NOT_FOUND);
    // The tail reads as held; only the live range was claimable.
    assert_eq!(registry.count(), 256);
    registry.reset_limited(256);
    assert_eq!(registry.count(), 0);
    assert_eq!(registry.find_free_run(256), 0);
}

#[test]
fn emptiness_tracks_hint_and_words() {
    let words = backing(128);
    let registry = registry_over(&words, 128);
    assert!(registry.is_empty());
    let bit = registry.find_free();
    assert!(!registry.is_empty());
    registry.free(bit);
    assert!(registry.is_empty());
    // A full first word flips the hint forward; emptiness must still
    // resolve correctly after everything is freed again.
    for _ in 0..65 {
        registry.find_free();
    }
    for i in 0..65 {
        registry.free(i);
    }
    assert!(registry.is_empty());
}
