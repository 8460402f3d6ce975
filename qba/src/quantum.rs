//! Quantum allocator: a fixed region of reusable partition slots.
//!
//! Each of the three quantum allocators owns a contiguous region split
//! into equal partition-sized spans, a registry of online slots, and one
//! order-registry per quantum order it serves. Slots come online lazily
//! on the first allocation miss at an order, and an online slot whose
//! partition has drained can be taken offline and retooled for a
//! different order.
//!
//! # Offline handshake
//!
//! Retooling a partition races with in-flight allocations. Both sides use
//! sequentially consistent operations:
//!
//! - an allocator *pins* the partition, then re-reads the slot's
//!   order-registry bit; if the bit is gone it unpins and walks away
//!   without touching the registry.
//! - the offliner clears the bit, then reads the pin count and the live
//!   census. Any allocator that could still touch the registry is either
//!   pinned (pin count ≠ 0) or will observe the cleared bit after its
//!   pin, so a zero pin count plus an empty census proves the partition
//!   is quiescent and safe to retool.
//!
//! In the sequentially consistent total order the pin precedes the bit
//! re-read and the bit clear precedes the pin-count read, so the two
//! sides cannot both miss each other.

use core::sync::atomic::AtomicU64;

use qba_lib::{NOT_FOUND, size_to_order};

use crate::arena::Arena;
use crate::config::DirectorFlags;
use crate::constants::{MAX_PARTITION_QUANTA, ORDERS_PER_QUANTUM_ALLOCATOR};
use crate::director::Director;
use crate::os;
use crate::partition::{Partition, PartitionInit};
use crate::registry::{Registry, words_for};

/// Shape of one quantum region, fixed by configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegionGeometry {
    pub partition_count: u32,
    pub partition_size_order: u32,
    pub smallest_order: u32,
    pub side_data_size: u32,
}

impl RegionGeometry {
    pub fn largest_order(&self) -> u32 {
        self.smallest_order + ORDERS_PER_QUANTUM_ALLOCATOR - 1
    }

    /// Quanta per partition at the smallest served order; every slot's
    /// registry words and side data are sized for this worst case.
    pub fn max_quanta(&self) -> u32 {
        let span = 1u64 << (self.partition_size_order - self.smallest_order);
        (span as u32).min(MAX_PARTITION_QUANTA)
    }

    pub fn region_bytes(&self) -> u64 {
        (self.partition_count as u64) << self.partition_size_order
    }
}

/// Metadata addresses of one quantum allocator, produced identically by
/// the sizing and commit passes.
pub struct QuantumCarve {
    self_addr: u64,
    partitions: u64,
    ctrl_words: u64,
    slot_words: u64,
    side_pool: u64,
    admin_bytes: u64,
}

#[repr(C)]
pub struct QuantumAllocator {
    region_base: u64,
    partition_size_order: u32,
    partition_count: u32,
    smallest_order: u32,
    largest_order: u32,
    side_data_size: u32,
    flags: DirectorFlags,
    max_quanta: u32,
    words_per_slot: u32,
    admin_bytes: u64,
    partitions: *mut Partition,
    slot_words: *mut AtomicU64,
    side_pool: *mut u8,
    side_bytes_per_slot: u64,
    director: *mut Director,
    /// Bit per slot: the slot is online (committed and constructed).
    partition_registry: Registry,
    /// Bit per slot and served order: the slot currently serves it. A
    /// slot appears in at most one order-registry at a time.
    order_registries: [Registry; ORDERS_PER_QUANTUM_ALLOCATOR as usize],
}

unsafe impl Send for QuantumAllocator {}
unsafe impl Sync for QuantumAllocator {}

impl QuantumAllocator {
    /// Lay out the allocator's metadata: the object itself, the partition
    /// slot array, control registry words (slot registry plus one per
    /// order), per-slot quantum registry words, and the side-data pool.
    pub fn carve(arena: &mut Arena, geometry: &RegionGeometry) -> QuantumCarve {
        let before = arena.used();
        let count = geometry.partition_count as u64;
        let self_addr = arena.alloc_value::<QuantumAllocator>() as u64;
        let partitions = arena.alloc_array::<Partition>(count) as u64;
        let ctrl = (1 + ORDERS_PER_QUANTUM_ALLOCATOR as u64)
            * words_for(geometry.partition_count) as u64;
        let ctrl_words = arena.alloc_array::<AtomicU64>(ctrl) as u64;
        let words_per_slot = words_for(geometry.max_quanta()) as u64;
        let slot_words = arena.alloc_array::<AtomicU64>(words_per_slot * count) as u64;
        let side_bytes = geometry.side_data_size as u64 * geometry.max_quanta() as u64 * count;
        let side_pool = if side_bytes != 0 {
            arena.alloc(side_bytes, 8)
        } else {
            0
        };
        QuantumCarve {
            self_addr,
            partitions,
            ctrl_words,
            slot_words,
            side_pool,
            admin_bytes: arena.used() - before,
        }
    }

    /// Construct the allocator in place over a carve from the live arena.
    ///
    /// # Safety
    ///
    /// The carve must come from the committed metadata area and
    /// `region_base` must be the reserved span this allocator owns.
    pub unsafe fn init_at(
        carve: &QuantumCarve,
        geometry: &RegionGeometry,
        region_base: u64,
        flags: DirectorFlags,
        director: *mut Director,
    ) -> *mut QuantumAllocator {
        let at = carve.self_addr as usize as *mut QuantumAllocator;
        let ctrl = carve.ctrl_words as usize as *mut AtomicU64;
        let ctrl_stride = words_for(geometry.partition_count) as usize;
        let partition_registry =
            Registry::new(ctrl, geometry.partition_count);
        let order_registries = core::array::from_fn(|k| {
            Registry::new(
                unsafe { ctrl.add((k + 1) * ctrl_stride) },
                geometry.partition_count,
            )
        });
        unsafe {
            at.write(QuantumAllocator {
                region_base,
                partition_size_order: geometry.partition_size_order,
                partition_count: geometry.partition_count,
                smallest_order: geometry.smallest_order,
                largest_order: geometry.largest_order(),
                side_data_size: geometry.side_data_size,
                flags,
                max_quanta: geometry.max_quanta(),
                words_per_slot: words_for(geometry.max_quanta()),
                admin_bytes: carve.admin_bytes,
                partitions: carve.partitions as usize as *mut Partition,
                slot_words: carve.slot_words as usize as *mut AtomicU64,
                side_pool: carve.side_pool as usize as *mut u8,
                side_bytes_per_slot: geometry.side_data_size as u64
                    * geometry.max_quanta() as u64,
                director,
                partition_registry,
                order_registries,
            });
            (*at).partition_registry.reset();
            for registry in &(*at).order_registries {
                registry.reset();
            }
        }
        at
    }

    #[inline]
    pub fn smallest_order(&self) -> u32 {
        self.smallest_order
    }

    #[inline]
    pub fn largest_order(&self) -> u32 {
        self.largest_order
    }

    #[inline]
    pub fn region_base(&self) -> u64 {
        self.region_base
    }

    #[inline]
    pub fn region_bytes(&self) -> u64 {
        (self.partition_count as u64) << self.partition_size_order
    }

    #[inline]
    pub fn admin_bytes(&self) -> u64 {
        self.admin_bytes
    }

    #[inline]
    pub fn owns(&self, addr: u64) -> bool {
        addr >= self.region_base && addr < self.region_base + self.region_bytes()
    }

    #[inline]
    fn partition_ptr(&self, slot: u32) -> *mut Partition {
        debug_assert!(slot < self.partition_count);
        unsafe { self.partitions.add(slot as usize) }
    }

    #[inline]
    fn partition(&self, slot: u32) -> &Partition {
        unsafe { &*self.partition_ptr(slot) }
    }

    #[inline]
    fn slot_of(&self, addr: u64) -> u32 {
        debug_assert!(self.owns(addr));
        ((addr - self.region_base) >> self.partition_size_order) as u32
    }

    #[inline]
    fn partition_span(&self, slot: u32) -> u64 {
        self.region_base + ((slot as u64) << self.partition_size_order)
    }

    /// Quanta a partition holds when specialized for `order`.
    #[inline]
    fn quanta_for(&self, order: u32) -> u32 {
        let span = 1u64 << (self.partition_size_order - order);
        (span as u32).min(MAX_PARTITION_QUANTA)
    }

    fn order_for(&self, size: u64) -> Option<u32> {
        let order = size_to_order(size).max(self.smallest_order);
        if order > self.largest_order {
            return None;
        }
        Some(order)
    }

    /// One allocation attempt against an online partition, under the
    /// offline handshake: pin, re-check membership, claim, unpin.
    fn try_partition(&self, slot: u32, k: u32, size: u64, count: u32) -> u64 {
        let part = self.partition(slot);
        part.pin();
        if !self.order_registries[k as usize].is_set_seq(slot) {
            part.unpin();
            return 0;
        }
        let addr = if count == 1 {
            part.allocate(size)
        } else {
            part.allocate_run(count)
        };
        part.unpin();
        addr
    }

    /// Try every partition currently serving order index `k`.
    fn allocate_online(&self, k: u32, size: u64, count: u32) -> u64 {
        let registry = &self.order_registries[k as usize];
        let mut slot = registry.next_set(0);
        while slot != NOT_FOUND {
            let addr = self.try_partition(slot, k, size, count);
            if addr != 0 {
                return addr;
            }
            slot = registry.next_set(slot + 1);
        }
        0
    }

    /// Commit and construct a fresh slot for `order`. Returns the slot,
    /// or `None` when no free slot exists or the commit failed.
    fn bring_online(&self, order: u32) -> Option<u32> {
        let slot = self.partition_registry.find_free();
        if slot == NOT_FOUND {
            return None;
        }
        let span = self.partition_span(slot);
        let bytes = 1u64 << self.partition_size_order;
        if let Err(err) = os::commit(span, bytes) {
            log::error!("partition commit at {:#x} failed: {}", span, err);
            self.partition_registry.free(slot);
            return None;
        }
        let side_data = if self.side_bytes_per_slot != 0 {
            unsafe { self.side_pool.add((slot as u64 * self.side_bytes_per_slot) as usize) }
        } else {
            core::ptr::null_mut()
        };
        unsafe {
            Partition::init_at(
                self.partition_ptr(slot),
                PartitionInit {
                    base: span,
                    slot,
                    max_quanta: self.max_quanta,
                    words: self.slot_words.add((slot * self.words_per_slot) as usize),
                    side_data,
                    side_data_size: self.side_data_size,
                    flags: self.flags,
                    owner: self as *const _ as *mut QuantumAllocator,
                },
                order,
                self.quanta_for(order),
            );
        }
        let k = order - self.smallest_order;
        self.order_registries[k as usize].set(slot);
        unsafe { (*self.director).publish_partition(order, self.partition_ptr(slot)) };
        log::debug!(
            "slot {} online at {:#x} for order {}",
            slot,
            span,
            order
        );
        Some(slot)
    }

    /// Take an empty partition at another order offline and retool it
    /// for `order`. Scans high slots first so low slots stay packed.
    fn respecialize(&self, order: u32) -> Option<u32> {
        for slot in (0..self.partition_count).rev() {
            if !self.partition_registry.is_set(slot) {
                continue;
            }
            let part = self.partition(slot);
            let from_order = part.quantum_order();
            if from_order == order || !part.is_empty() {
                continue;
            }
            let j = from_order - self.smallest_order;
            if !self.order_registries[j as usize].clear_seq(slot) {
                // Another thread owns the offline transition.
                continue;
            }
            unsafe {
                (*self.director)
                    .restore_quantum(from_order, self as *const _ as *mut QuantumAllocator)
            };
            // Post-offline verification; see the module notes.
            if part.pinned() != 0 || !part.is_empty() {
                self.order_registries[j as usize].set(slot);
                unsafe { (*self.director).publish_partition(from_order, self.partition_ptr(slot)) };
                continue;
            }
            part.retool(order, self.quanta_for(order));
            let k = order - self.smallest_order;
            self.order_registries[k as usize].set(slot);
            unsafe { (*self.director).publish_partition(order, self.partition_ptr(slot)) };
            log::debug!(
                "slot {} retooled from order {} to order {}",
                slot,
                from_order,
                order
            );
            return Some(slot);
        }
        None
    }

    /// Claim `count` contiguous quanta of the order covering `size`.
    pub(crate) fn allocate_quanta(&self, size: u64, count: u32) -> u64 {
        let Some(order) = self.order_for(size) else {
            return 0;
        };
        if count == 0 || count > self.quanta_for(order) {
            return 0;
        }
        let k = order - self.smallest_order;
        let addr = self.allocate_online(k, size, count);
        if addr != 0 {
            return addr;
        }
        // Slow path: grow, then cannibalize. Bounded retries; concurrent
        // churn can invalidate any single observation.
        for _ in 0..64 {
            if let Some(slot) = self.bring_online(order) {
                let addr = self.try_partition(slot, k, size, count);
                if addr != 0 {
                    return addr;
                }
                continue;
            }
            if let Some(slot) = self.respecialize(order) {
                let addr = self.try_partition(slot, k, size, count);
                if addr != 0 {
                    return addr;
                }
                continue;
            }
            let addr = self.allocate_online(k, size, count);
            if addr != 0 {
                return addr;
            }
            log::debug!("order {} exhausted: no free or reclaimable slot", order);
            return 0;
        }
        0
    }

    /// Claim one quantum of the order covering `size`.
    pub fn allocate(&self, size: u64) -> u64 {
        self.allocate_quanta(size, 1)
    }

    /// Roster short-circuit entry: try the published partition first,
    /// fall back to the full path.
    pub(crate) fn allocate_from_partition(&self, part: &Partition, size: u64) -> u64 {
        if let Some(order) = self.order_for(size) {
            if part.quantum_order() == order {
                let k = order - self.smallest_order;
                let addr = self.try_partition(part.slot(), k, size, 1);
                if addr != 0 {
                    return addr;
                }
            }
        }
        self.allocate(size)
    }

    /// Release the quantum containing `addr`.
    pub fn deallocate(&self, addr: u64) {
        let slot = self.slot_of(addr);
        debug_assert!(self.partition_registry.is_set(slot), "free into offline slot");
        if !self.partition_registry.is_set(slot) {
            return;
        }
        self.partition(slot).deallocate(addr);
    }

    /// Claim `count` contiguous blocks of `size` (a power of two).
    pub fn allocate_count(&self, size: u64, count: u32) -> u64 {
        self.allocate_quanta(size, count)
    }

    /// Release `count` contiguous blocks of `size` starting at `addr`.
    pub fn deallocate_count(&self, addr: u64, count: u32) {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return;
        }
        self.partition(slot).deallocate_run(addr, count);
    }

    /// Fill `out` with blocks of `size`. Contiguous mode is all or
    /// nothing; sparse mode may return a partial count.
    pub fn allocate_bulk(&self, size: u64, out: &mut [u64], contiguous: bool) -> usize {
        if out.is_empty() {
            return 0;
        }
        if contiguous {
            let addr = self.allocate_quanta(size, out.len() as u32);
            if addr == 0 {
                return 0;
            }
            let Some(order) = self.order_for(size) else {
                return 0;
            };
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = addr + ((i as u64) << order);
            }
            return out.len();
        }
        let Some(order) = self.order_for(size) else {
            return 0;
        };
        let k = order - self.smallest_order;
        let mut filled = 0;
        for _ in 0..64 {
            if filled == out.len() {
                break;
            }
            let registry = &self.order_registries[k as usize];
            let mut slot = registry.next_set(0);
            while slot != NOT_FOUND && filled < out.len() {
                let part = self.partition(slot);
                part.pin();
                if registry.is_set_seq(slot) {
                    filled += part.allocate_bulk_sparse(&mut out[filled..]);
                }
                part.unpin();
                slot = registry.next_set(slot + 1);
            }
            if filled == out.len() {
                break;
            }
            if self.bring_online(order).is_none() && self.respecialize(order).is_none() {
                break;
            }
        }
        filled
    }

    /// Release a batch of addresses, chunked per owning partition.
    pub fn deallocate_bulk(&self, addrs: &[u64]) {
        let mut k = 0;
        while k < addrs.len() {
            let slot = self.slot_of(addrs[k]);
            let mut j = k + 1;
            while j < addrs.len() && self.slot_of(addrs[j]) == slot {
                j += 1;
            }
            if self.partition_registry.is_set(slot) {
                self.partition(slot).deallocate_bulk(&addrs[k..j]);
            }
            k = j;
        }
    }

    /// Next live quantum after `prev` (0 starts the walk), in slot order
    /// then quantum order, or 0 when exhausted.
    pub fn next_allocation(&self, prev: u64) -> u64 {
        let mut slot = if prev == 0 {
            self.partition_registry.next_set(0)
        } else {
            let here = self.slot_of(prev);
            if self.partition_registry.is_set(here) {
                let addr = self.partition(here).next_allocation(prev);
                if addr != 0 {
                    return addr;
                }
            }
            self.partition_registry.next_set(here + 1)
        };
        while slot != NOT_FOUND {
            let addr = self.partition(slot).next_allocation(0);
            if addr != 0 {
                return addr;
            }
            slot = self.partition_registry.next_set(slot + 1);
        }
        0
    }

    /// Allocated size of the quantum holding `addr`, or 0.
    pub fn allocated_size(&self, addr: u64) -> u64 {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return 0;
        }
        self.partition(slot).allocated_size(addr)
    }

    /// Base of the live allocation containing `addr`, or 0.
    pub fn allocation_base(&self, addr: u64) -> u64 {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return 0;
        }
        self.partition(slot).allocation_base(addr)
    }

    /// Side-data address for the allocation holding `addr`, or 0.
    pub fn side_data_of(&self, addr: u64) -> u64 {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return 0;
        }
        self.partition(slot).side_data_of(addr)
    }

    /// Live quanta at `order` across every partition serving it. Sampled.
    pub fn census(&self, order: u32) -> u64 {
        if order < self.smallest_order || order > self.largest_order {
            return 0;
        }
        let registry = &self.order_registries[(order - self.smallest_order) as usize];
        let mut live = 0u64;
        let mut slot = registry.next_set(0);
        while slot != NOT_FOUND {
            live += self.partition(slot).census() as u64;
            slot = registry.next_set(slot + 1);
        }
        live
    }

    /// Live census per served order, accumulated into the stats arrays.
    pub fn accumulate_stats(&self, counts: &mut [u64; 64], sizes: &mut [u64; 64]) {
        for k in 0..ORDERS_PER_QUANTUM_ALLOCATOR {
            let order = self.smallest_order + k;
            let live = self.census(order);
            counts[order as usize] += live;
            sizes[order as usize] += live << order;
        }
    }
}
