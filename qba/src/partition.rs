//! A partition: one size-aligned span carved into equal-size quanta.
//!
//! The span's base is aligned to the span size, so every quantum is
//! naturally aligned to the quantum size and index↔address conversion is
//! pure shift arithmetic. One registry bit tracks each quantum; one
//! side-data cell rides along with it, off-band.
//!
//! A partition slot is constructed once when it first comes online and
//! afterwards only *retooled* for a different quantum order. The fields a
//! retool rewrites (order and live quantum count) are atomics, so
//! concurrent queries sample a coherent value; the registry's word store
//! is sized for the smallest order the slot can serve and the unusable
//! tail is pre-seeded busy.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use qba_lib::{NOT_FOUND, ctz};

use crate::config::DirectorFlags;
use crate::os;
use crate::quantum::QuantumAllocator;
use crate::registry::{Registry, words_for};

#[repr(C)]
pub struct Partition {
    base: u64,
    slot: u32,
    side_data_size: u32,
    flags: DirectorFlags,
    quantum_order: AtomicU32,
    quantum_count: AtomicU32,
    /// Threads currently inside an allocation attempt on this partition.
    /// Part of the offline handshake; see the quantum allocator.
    inflight: AtomicU32,
    side_data: *mut u8,
    owner: *mut QuantumAllocator,
    registry: Registry,
}

unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

pub struct PartitionInit {
    pub base: u64,
    pub slot: u32,
    pub max_quanta: u32,
    pub words: *mut AtomicU64,
    pub side_data: *mut u8,
    pub side_data_size: u32,
    pub flags: DirectorFlags,
    pub owner: *mut QuantumAllocator,
}

impl Partition {
    /// Construct a partition in place at `at`, specialized for
    /// `quantum_order` with `quantum_count` live quanta.
    ///
    /// # Safety
    ///
    /// `at`, the word storage and the side-data storage must be valid,
    /// exclusively owned by this slot, and sized for `max_quanta`.
    pub unsafe fn init_at(at: *mut Partition, init: PartitionInit, quantum_order: u32, quantum_count: u32) {
        let registry = Registry::new(init.words, init.max_quanta);
        unsafe {
            at.write(Partition {
                base: init.base,
                slot: init.slot,
                side_data_size: init.side_data_size,
                flags: init.flags,
                quantum_order: AtomicU32::new(quantum_order),
                quantum_count: AtomicU32::new(quantum_count),
                inflight: AtomicU32::new(0),
                side_data: init.side_data,
                owner: init.owner,
                registry,
            });
            (*at).registry.reset_limited(quantum_count);
        }
        debug_assert!(init.base % (1u64 << quantum_order) == 0);
    }

    /// Re-specialize an offline, verified-empty partition for a new
    /// order. The caller owns the offline transition exclusively.
    pub fn retool(&self, quantum_order: u32, quantum_count: u32) {
        debug_assert!(self.base % (1u64 << quantum_order) == 0);
        self.quantum_order.store(quantum_order, Ordering::Relaxed);
        self.quantum_count.store(quantum_count, Ordering::Relaxed);
        self.registry.reset_limited(quantum_count);
    }

    #[inline]
    pub fn quantum_order(&self) -> u32 {
        self.quantum_order.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn quantum_count(&self) -> u32 {
        self.quantum_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn quantum_size(&self) -> u64 {
        1u64 << self.quantum_order()
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn owner(&self) -> *mut QuantumAllocator {
        self.owner
    }

    #[inline]
    pub fn owns(&self, addr: u64) -> bool {
        addr >= self.base
            && addr < self.base + ((self.quantum_count() as u64) << self.quantum_order())
    }

    #[inline]
    fn index_of(&self, addr: u64) -> u32 {
        debug_assert!(self.owns(addr));
        ((addr - self.base) >> self.quantum_order()) as u32
    }

    #[inline]
    fn address_of(&self, index: u32) -> u64 {
        self.base + ((index as u64) << self.quantum_order())
    }

    fn zero_quanta(&self, addr: u64, count: u32) {
        os::zero(
            addr,
            (count as u64) << self.quantum_order(),
            self.flags.contains(DirectorFlags::SHARED),
        );
    }

    /// Claim one quantum. Returns its address, or 0 when the span is full.
    pub fn allocate(&self, size: u64) -> u64 {
        debug_assert!(size <= self.quantum_size());
        let index = self.registry.find_free();
        if index == NOT_FOUND {
            return 0;
        }
        self.address_of(index)
    }

    /// Release the quantum containing `addr`, zeroing it first in secure
    /// mode.
    pub fn deallocate(&self, addr: u64) {
        let index = self.index_of(addr);
        if self.flags.contains(DirectorFlags::SECURE) {
            self.zero_quanta(self.address_of(index), 1);
        }
        self.registry.free(index);
    }

    /// Claim `count` contiguous quanta. Returns the first address, or 0.
    pub fn allocate_run(&self, count: u32) -> u64 {
        if count > self.quantum_count() {
            return 0;
        }
        let index = self.registry.find_free_run(count);
        if index == NOT_FOUND {
            return 0;
        }
        self.address_of(index)
    }

    /// Release `count` contiguous quanta starting at `addr`.
    pub fn deallocate_run(&self, addr: u64, count: u32) {
        let index = self.index_of(addr);
        if self.flags.contains(DirectorFlags::SECURE) {
            self.zero_quanta(addr, count);
        }
        self.registry.free_run(index, count);
    }

    /// Claim scattered quanta until `out` is full, one word-wide CAS per
    /// registry word, emitting addresses in ascending index order.
    ///
    /// A word claim can grab more bits than the caller still needs; the
    /// surplus tail is returned immediately, but a concurrent census may
    /// transiently see those bits as held.
    pub fn allocate_bulk_sparse(&self, out: &mut [u64]) -> usize {
        let mut filled = 0;
        let word_count = words_for(self.registry.bit_count());
        for w in 0..word_count {
            if filled == out.len() {
                break;
            }
            let mut mask = self.registry.claim_word(w);
            while mask != 0 && filled < out.len() {
                let bit = mask & mask.wrapping_neg();
                out[filled] = self.address_of(w * 64 + ctz(bit));
                filled += 1;
                mask &= mask - 1;
            }
            if mask != 0 {
                self.registry.clear_mask(w, mask);
                break;
            }
        }
        filled
    }

    /// Claim `out.len()` contiguous quanta, all or nothing.
    pub fn allocate_bulk_contiguous(&self, out: &mut [u64]) -> usize {
        let first = self.allocate_run(out.len() as u32);
        if first == 0 {
            return 0;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = first + ((i as u64) << self.quantum_order());
        }
        out.len()
    }

    /// Release a batch of quanta, issuing one atomic clear per registry
    /// word for consecutive addresses that share one.
    pub fn deallocate_bulk(&self, addrs: &[u64]) {
        let secure = self.flags.contains(DirectorFlags::SECURE);
        let mut k = 0;
        while k < addrs.len() {
            let index = self.index_of(addrs[k]);
            let w = index / 64;
            let mut mask = 1u64 << (index % 64);
            if secure {
                self.zero_quanta(addrs[k], 1);
            }
            let mut j = k + 1;
            while j < addrs.len() {
                let next = self.index_of(addrs[j]);
                if next / 64 != w {
                    break;
                }
                mask |= 1u64 << (next % 64);
                if secure {
                    self.zero_quanta(addrs[j], 1);
                }
                j += 1;
            }
            self.registry.free_mask(w, mask);
            k = j;
        }
    }

    /// Address of the next live quantum after `prev` (0 starts the walk),
    /// or 0 when the rest of the span is free.
    pub fn next_allocation(&self, prev: u64) -> u64 {
        let from = if prev == 0 { 0 } else { self.index_of(prev) + 1 };
        let limit = self.quantum_count();
        let index = self.registry.next_set(from);
        if index == NOT_FOUND || index >= limit {
            return 0;
        }
        self.address_of(index)
    }

    /// Allocated size of the quantum holding `addr`, or 0 if it is free.
    pub fn allocated_size(&self, addr: u64) -> u64 {
        if self.registry.is_set(self.index_of(addr)) {
            self.quantum_size()
        } else {
            0
        }
    }

    /// Base of the live allocation containing `addr`, or 0.
    pub fn allocation_base(&self, addr: u64) -> u64 {
        if self.registry.is_set(self.index_of(addr)) {
            addr & !(self.quantum_size() - 1)
        } else {
            0
        }
    }

    /// Address of the side-data cell of the quantum holding `addr`, or 0.
    pub fn side_data_of(&self, addr: u64) -> u64 {
        if self.side_data_size == 0 {
            return 0;
        }
        let index = self.index_of(addr);
        if !self.registry.is_set(index) {
            return 0;
        }
        self.side_data as u64 + (index as u64) * (self.side_data_size as u64)
    }

    /// Live quanta count. Sampled; the pre-seeded busy tail above the
    /// live count is excluded.
    pub fn census(&self) -> u32 {
        let tail = self.registry.bit_count() - self.quantum_count();
        self.registry.count().saturating_sub(tail)
    }

    /// Emptiness hint for the re-specialization scan.
    pub fn is_empty(&self) -> bool {
        self.census() == 0
    }

    pub(crate) fn pin(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn pinned(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }
}
