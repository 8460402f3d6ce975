//! Slab allocator for requests above the largest quantum.
//!
//! Each allocation gets its own virtually-aligned extent, tracked in a
//! fixed table of slot records with an in-use registry over it. A
//! deallocated slot keeps its reservation: a later allocation of the
//! same or smaller size reuses the extent and only pays a commit, not a
//! fresh reservation.

use core::sync::atomic::{AtomicU64, Ordering};

use qba_lib::{NOT_FOUND, align_up_u64, size_to_order};

use crate::arena::Arena;
use crate::config::DirectorFlags;
use crate::constants::{MAX_ALLOCATION_SIZE, REGION_ALIGNMENT, SLAB_SIZE_GRAIN};
use crate::os;
use crate::registry::{Registry, words_for};

#[repr(C)]
struct SlabRecord {
    base: AtomicU64,
    /// Live (committed) bytes; 0 while the slot is free.
    live: AtomicU64,
    /// Reserved bytes retained across free/claim cycles for recycling.
    reserved: AtomicU64,
}

/// Metadata addresses of the slab allocator, produced identically by the
/// sizing and commit passes.
pub struct SlabCarve {
    self_addr: u64,
    records: u64,
    words: u64,
    side_pool: u64,
    admin_bytes: u64,
}

#[repr(C)]
pub struct SlabAllocator {
    max_count: u32,
    side_data_size: u32,
    flags: DirectorFlags,
    admin_bytes: u64,
    records: *mut SlabRecord,
    side_pool: *mut u8,
    registry: Registry,
}

unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

impl SlabAllocator {
    pub fn carve(arena: &mut Arena, max_count: u32, side_data_size: u32) -> SlabCarve {
        let before = arena.used();
        let self_addr = arena.alloc_value::<SlabAllocator>() as u64;
        let records = arena.alloc_array::<SlabRecord>(max_count as u64) as u64;
        let words = arena.alloc_array::<AtomicU64>(words_for(max_count) as u64) as u64;
        let side_bytes = side_data_size as u64 * max_count as u64;
        let side_pool = if side_bytes != 0 {
            arena.alloc(side_bytes, 8)
        } else {
            0
        };
        SlabCarve {
            self_addr,
            records,
            words,
            side_pool,
            admin_bytes: arena.used() - before,
        }
    }

    /// Construct the allocator in place over a carve from the live arena.
    ///
    /// # Safety
    ///
    /// The carve must come from the committed metadata area.
    pub unsafe fn init_at(
        carve: &SlabCarve,
        max_count: u32,
        side_data_size: u32,
        flags: DirectorFlags,
    ) -> *mut SlabAllocator {
        let at = carve.self_addr as usize as *mut SlabAllocator;
        let records = carve.records as usize as *mut SlabRecord;
        unsafe {
            at.write(SlabAllocator {
                max_count,
                side_data_size,
                flags,
                admin_bytes: carve.admin_bytes,
                records,
                side_pool: carve.side_pool as usize as *mut u8,
                registry: Registry::new(carve.words as usize as *mut AtomicU64, max_count),
            });
            (*at).registry.reset();
            for slot in 0..max_count {
                let record = &*records.add(slot as usize);
                record.base.store(0, Ordering::Relaxed);
                record.live.store(0, Ordering::Relaxed);
                record.reserved.store(0, Ordering::Relaxed);
            }
        }
        at
    }

    #[inline]
    pub fn admin_bytes(&self) -> u64 {
        self.admin_bytes
    }

    #[inline]
    fn record(&self, slot: u32) -> &SlabRecord {
        debug_assert!(slot < self.max_count);
        unsafe { &*self.records.add(slot as usize) }
    }

    fn slot_containing(&self, addr: u64) -> Option<u32> {
        let mut slot = self.registry.next_set(0);
        while slot != NOT_FOUND {
            let record = self.record(slot);
            let base = record.base.load(Ordering::Acquire);
            let live = record.live.load(Ordering::Acquire);
            if base != 0 && addr >= base && addr < base + live {
                return Some(slot);
            }
            slot = self.registry.next_set(slot + 1);
        }
        None
    }

    pub fn owns(&self, addr: u64) -> bool {
        self.slot_containing(addr).is_some()
    }

    /// Bytes an allocation of `size` occupies.
    fn extent_for(size: u64) -> u64 {
        align_up_u64(size, SLAB_SIZE_GRAIN)
    }

    /// Claim a slot and back it with `needed` committed bytes, recycling
    /// the slot's retained reservation when it is big enough.
    fn back_slot(&self, slot: u32, needed: u64) -> u64 {
        let record = self.record(slot);
        let old_base = record.base.load(Ordering::Relaxed);
        let old_reserved = record.reserved.load(Ordering::Relaxed);
        let base = if old_base != 0 && old_reserved >= needed {
            if old_reserved > needed {
                os::release(old_base + needed, old_reserved - needed);
                record.reserved.store(needed, Ordering::Relaxed);
            }
            old_base
        } else {
            if old_base != 0 {
                os::release(old_base, old_reserved);
                record.base.store(0, Ordering::Relaxed);
                record.reserved.store(0, Ordering::Relaxed);
            }
            match os::reserve_aligned(needed, REGION_ALIGNMENT) {
                Ok(base) => {
                    record.base.store(base, Ordering::Relaxed);
                    record.reserved.store(needed, Ordering::Relaxed);
                    base
                }
                Err(err) => {
                    log::error!("slab reservation of {:#x} bytes failed: {}", needed, err);
                    return 0;
                }
            }
        };
        if os::commit(base, needed).is_err() {
            return 0;
        }
        record.live.store(needed, Ordering::Release);
        base
    }

    pub fn allocate(&self, size: u64) -> u64 {
        if size == 0 || size > MAX_ALLOCATION_SIZE {
            return 0;
        }
        let needed = Self::extent_for(size);
        let slot = self.registry.find_free();
        if slot == NOT_FOUND {
            log::warn!("slab table full ({} slots)", self.max_count);
            return 0;
        }
        let base = self.back_slot(slot, needed);
        if base == 0 {
            self.registry.free(slot);
            return 0;
        }
        base
    }

    /// Release the slab containing `addr`. The reservation is retained
    /// for recycling; only the physical backing is dropped.
    pub fn deallocate(&self, addr: u64) {
        let Some(slot) = self.slot_containing(addr) else {
            return;
        };
        let record = self.record(slot);
        let base = record.base.load(Ordering::Relaxed);
        let live = record.live.load(Ordering::Relaxed);
        if self.flags.contains(DirectorFlags::SECURE) {
            // Uncommit alone discards the backing; secure mode writes
            // first so the guarantee does not depend on it.
            os::zero(base, live, false);
        }
        os::uncommit(base, live);
        record.live.store(0, Ordering::Release);
        self.registry.free(slot);
    }

    /// Claim `count` adjacent blocks of `size`: one aggregate
    /// reservation, split across `count` slot records.
    pub fn allocate_count(&self, size: u64, count: u32) -> u64 {
        if size == 0 || count == 0 || size > MAX_ALLOCATION_SIZE {
            return 0;
        }
        let each = Self::extent_for(size);
        let total = each * count as u64;
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let slot = self.registry.find_free();
            if slot == NOT_FOUND {
                for claimed in slots {
                    self.registry.free(claimed);
                }
                return 0;
            }
            slots.push(slot);
        }
        let aggregate = match os::reserve_aligned(total, REGION_ALIGNMENT) {
            Ok(base) => base,
            Err(_) => {
                for claimed in slots {
                    self.registry.free(claimed);
                }
                return 0;
            }
        };
        if os::commit(aggregate, total).is_err() {
            os::release(aggregate, total);
            for claimed in slots {
                self.registry.free(claimed);
            }
            return 0;
        }
        for (i, slot) in slots.into_iter().enumerate() {
            let record = self.record(slot);
            let old_base = record.base.load(Ordering::Relaxed);
            if old_base != 0 {
                os::release(old_base, record.reserved.load(Ordering::Relaxed));
            }
            let base = aggregate + i as u64 * each;
            record.base.store(base, Ordering::Relaxed);
            record.reserved.store(each, Ordering::Relaxed);
            record.live.store(each, Ordering::Release);
        }
        aggregate
    }

    /// Release `count` adjacent blocks of `size` starting at `addr`.
    pub fn deallocate_count(&self, addr: u64, size: u64, count: u32) {
        let each = Self::extent_for(size);
        for i in 0..count {
            self.deallocate(addr + i as u64 * each);
        }
    }

    /// Fill `out` with blocks of `size`. Contiguous mode is all or
    /// nothing; sparse mode may return a partial count.
    pub fn allocate_bulk(&self, size: u64, out: &mut [u64], contiguous: bool) -> usize {
        if out.is_empty() {
            return 0;
        }
        if contiguous {
            let each = Self::extent_for(size);
            let base = self.allocate_count(size, out.len() as u32);
            if base == 0 {
                return 0;
            }
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = base + i as u64 * each;
            }
            return out.len();
        }
        let mut filled = 0;
        while filled < out.len() {
            let addr = self.allocate(size);
            if addr == 0 {
                break;
            }
            out[filled] = addr;
            filled += 1;
        }
        filled
    }

    pub fn deallocate_bulk(&self, addrs: &[u64]) {
        for &addr in addrs {
            self.deallocate(addr);
        }
    }

    /// Next live slab after the one containing `prev`, in table order.
    pub fn next_allocation(&self, prev: u64) -> u64 {
        let from = if prev == 0 {
            0
        } else {
            match self.slot_containing(prev) {
                Some(slot) => slot + 1,
                None => return 0,
            }
        };
        let slot = self.registry.next_set(from);
        if slot == NOT_FOUND {
            return 0;
        }
        self.record(slot).base.load(Ordering::Acquire)
    }

    pub fn allocated_size(&self, addr: u64) -> u64 {
        match self.slot_containing(addr) {
            Some(slot) => self.record(slot).live.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn allocation_base(&self, addr: u64) -> u64 {
        match self.slot_containing(addr) {
            Some(slot) => self.record(slot).base.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn side_data_of(&self, addr: u64) -> u64 {
        if self.side_data_size == 0 {
            return 0;
        }
        match self.slot_containing(addr) {
            Some(slot) => {
                self.side_pool as u64 + slot as u64 * self.side_data_size as u64
            }
            None => 0,
        }
    }

    pub fn accumulate_stats(&self, counts: &mut [u64; 64], sizes: &mut [u64; 64]) {
        let mut slot = self.registry.next_set(0);
        while slot != NOT_FOUND {
            let live = self.record(slot).live.load(Ordering::Acquire);
            if live != 0 {
                let order = size_to_order(live) as usize;
                counts[order] += 1;
                sizes[order] += live;
            }
            slot = self.registry.next_set(slot + 1);
        }
    }

    /// Release every retained reservation. Only meaningful on destroy.
    pub fn release_all(&self) {
        for slot in 0..self.max_count {
            let record = self.record(slot);
            let base = record.base.load(Ordering::Relaxed);
            let reserved = record.reserved.load(Ordering::Relaxed);
            if base != 0 && reserved != 0 {
                os::release(base, reserved);
                record.base.store(0, Ordering::Relaxed);
                record.reserved.store(0, Ordering::Relaxed);
                record.live.store(0, Ordering::Relaxed);
            }
        }
    }
}
