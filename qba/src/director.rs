//! Top-level orchestrator.
//!
//! The director owns one reservation holding the three quantum regions,
//! all allocator metadata, and the director object itself. Requests are
//! dispatched through the *roster*, a per-order table of tagged component
//! pointers: initially each order points at its quantum or slab
//! allocator, and a partition that comes online overwrites its order's
//! entry to short-circuit the next allocation straight to itself.
//!
//! Construction runs the carving code twice: a sizing pass over an
//! unbounded arena to learn the footprint, then a commit pass over the
//! real metadata area. Attaching to an existing shared object skips the
//! commit pass entirely and re-derives the director from the layout,
//! which is deterministic given an identical configuration.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use qba_lib::{align_up_u64, ctz, round_up_pow2, size_to_order};

use crate::arena::Arena;
use crate::config::{DirectorConfig, DirectorFlags};
use crate::constants::{
    LARGEST_QUANTUM_ORDER, MAX_ALLOCATION_ORDER, MAX_ALLOCATION_SIZE, MAX_LINK_NAME, ORDER_COUNT,
    PARTITION_SIZE_ORDERS, QUANTUM_ALLOCATOR_COUNT, REGION_ALIGNMENT, REGION_SMALLEST_ORDERS,
    SMALLEST_SIZE_ORDER, STATS_SLOT_ADMIN, STATS_SLOT_TOTAL,
};
use crate::error::QbaError;
use crate::os;
use crate::partition::Partition;
use crate::quantum::{QuantumAllocator, RegionGeometry};
use crate::slab::SlabAllocator;

const TAG_MASK: u64 = 0b11;
const TAG_NULL: u64 = 0;
const TAG_QUANTUM: u64 = 1;
const TAG_SLAB: u64 = 2;
const TAG_PARTITION: u64 = 3;

/// One roster entry: a component pointer tagged in its low bits. The
/// component family is closed, so dispatch is a three-way branch, not
/// open polymorphism.
#[derive(Clone, Copy)]
enum AllocatorRef {
    Null,
    Quantum(*mut QuantumAllocator),
    Slab(*mut SlabAllocator),
    Partition(*mut Partition),
}

impl AllocatorRef {
    fn encode(self) -> u64 {
        match self {
            Self::Null => TAG_NULL,
            Self::Quantum(ptr) => ptr as u64 | TAG_QUANTUM,
            Self::Slab(ptr) => ptr as u64 | TAG_SLAB,
            Self::Partition(ptr) => ptr as u64 | TAG_PARTITION,
        }
    }

    fn decode(raw: u64) -> Self {
        let ptr = raw & !TAG_MASK;
        match raw & TAG_MASK {
            TAG_QUANTUM => Self::Quantum(ptr as usize as *mut QuantumAllocator),
            TAG_SLAB => Self::Slab(ptr as usize as *mut SlabAllocator),
            TAG_PARTITION => Self::Partition(ptr as usize as *mut Partition),
            _ => Self::Null,
        }
    }
}

#[repr(C)]
pub struct Director {
    region_base: u64,
    region_size: u64,
    quantum_bytes: u64,
    flags: DirectorFlags,
    side_data_size: u32,
    link_name: [u8; MAX_LINK_NAME],
    link_name_len: u32,
    admin_bytes: u64,
    user_reference: AtomicU64,
    quantum: [*mut QuantumAllocator; QUANTUM_ALLOCATOR_COUNT],
    slab: *mut SlabAllocator,
    roster: [AtomicU64; ORDER_COUNT],
}

unsafe impl Send for Director {}
unsafe impl Sync for Director {}

impl Director {
    fn geometries(config: &DirectorConfig) -> [RegionGeometry; QUANTUM_ALLOCATOR_COUNT] {
        let counts = [
            config.small_partitions,
            config.medium_partitions,
            config.large_partitions,
        ];
        core::array::from_fn(|i| RegionGeometry {
            partition_count: counts[i],
            partition_size_order: PARTITION_SIZE_ORDERS[i],
            smallest_order: REGION_SMALLEST_ORDERS[i],
            side_data_size: config.side_data_size,
        })
    }

    fn quantum_region_bytes(geometries: &[RegionGeometry; QUANTUM_ALLOCATOR_COUNT]) -> u64 {
        geometries.iter().map(RegionGeometry::region_bytes).sum()
    }

    /// Region base addresses within the reservation: regions are carved
    /// largest partition size first so every partition base stays
    /// naturally aligned to its own size.
    fn region_bases(
        base: u64,
        geometries: &[RegionGeometry; QUANTUM_ALLOCATOR_COUNT],
    ) -> [u64; QUANTUM_ALLOCATOR_COUNT] {
        let large = base;
        let medium = large + geometries[2].region_bytes();
        let small = medium + geometries[1].region_bytes();
        [small, medium, large]
    }

    /// Total reservation bytes for a configuration, page-rounded.
    pub fn required_size(config: &DirectorConfig) -> u64 {
        let geometries = Self::geometries(config);
        let mut arena = Arena::sizing();
        let _ = arena.alloc_value::<Director>();
        for geometry in &geometries {
            QuantumAllocator::carve(&mut arena, geometry);
        }
        SlabAllocator::carve(&mut arena, config.max_slabs, config.side_data_size);
        align_up_u64(
            Self::quantum_region_bytes(&geometries) + arena.used(),
            os::page_size(),
        )
    }

    /// Lay out and construct every component inside `[base, base+size)`.
    unsafe fn build(
        base: u64,
        size: u64,
        config: &DirectorConfig,
    ) -> Result<*mut Director, QbaError> {
        let geometries = Self::geometries(config);
        let quantum_bytes = Self::quantum_region_bytes(&geometries);
        let metadata_base = base + quantum_bytes;
        let metadata_size = size - quantum_bytes;
        os::commit(metadata_base, metadata_size)?;

        let mut arena = Arena::live(metadata_base, metadata_size);
        let director = arena.alloc_value::<Director>();
        debug_assert_eq!(director as u64, metadata_base);

        let flags = config.flags();
        let region_bases = Self::region_bases(base, &geometries);
        let mut quantum: [*mut QuantumAllocator; QUANTUM_ALLOCATOR_COUNT] =
            [core::ptr::null_mut(); QUANTUM_ALLOCATOR_COUNT];
        for i in 0..QUANTUM_ALLOCATOR_COUNT {
            let carve = QuantumAllocator::carve(&mut arena, &geometries[i]);
            quantum[i] = unsafe {
                QuantumAllocator::init_at(&carve, &geometries[i], region_bases[i], flags, director)
            };
        }
        let slab_carve = SlabAllocator::carve(&mut arena, config.max_slabs, config.side_data_size);
        let slab = unsafe {
            SlabAllocator::init_at(&slab_carve, config.max_slabs, config.side_data_size, flags)
        };

        let mut link_name = [0u8; MAX_LINK_NAME];
        let mut link_name_len = 0u32;
        if let Some(name) = &config.link_name {
            let bytes = name.as_bytes();
            link_name[..bytes.len()].copy_from_slice(bytes);
            link_name_len = bytes.len() as u32;
        }

        unsafe {
            director.write(Director {
                region_base: base,
                region_size: size,
                quantum_bytes,
                flags,
                side_data_size: config.side_data_size,
                link_name,
                link_name_len,
                admin_bytes: size_of::<Director>() as u64,
                user_reference: AtomicU64::new(0),
                quantum,
                slab,
                roster: core::array::from_fn(|_| AtomicU64::new(0)),
            });
            (*director).init_roster();
        }
        log::info!(
            "director at {:#x}: {:#x} reserved, {:#x} quantum, {:#x} metadata",
            base,
            size,
            quantum_bytes,
            metadata_size
        );
        Ok(director)
    }

    fn init_roster(&self) {
        for order in 0..ORDER_COUNT as u32 {
            let entry = if order < SMALLEST_SIZE_ORDER || order > MAX_ALLOCATION_ORDER {
                AllocatorRef::Null
            } else if order <= LARGEST_QUANTUM_ORDER {
                let region = ((order - SMALLEST_SIZE_ORDER) / 8) as usize;
                AllocatorRef::Quantum(self.quantum[region])
            } else {
                AllocatorRef::Slab(self.slab)
            };
            self.roster[order as usize].store(entry.encode(), Ordering::Release);
        }
    }

    fn roster_entry(&self, order: u32) -> AllocatorRef {
        AllocatorRef::decode(self.roster[order as usize].load(Ordering::Acquire))
    }

    /// Short-circuit future allocations at this order straight to a
    /// freshly specialized partition.
    pub(crate) fn publish_partition(&self, order: u32, partition: *mut Partition) {
        self.roster[order as usize].store(
            AllocatorRef::Partition(partition).encode(),
            Ordering::Release,
        );
    }

    /// Point an order back at its owning quantum allocator (partition
    /// going offline).
    pub(crate) fn restore_quantum(&self, order: u32, quantum: *mut QuantumAllocator) {
        self.roster[order as usize]
            .store(AllocatorRef::Quantum(quantum).encode(), Ordering::Release);
    }

    pub fn region_base(&self) -> u64 {
        self.region_base
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(DirectorFlags::SECURE)
    }

    /// Configured per-allocation side-data bytes.
    pub fn side_data_size(&self) -> u32 {
        self.side_data_size
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(DirectorFlags::SHARED)
    }

    fn link_name_str(&self) -> Option<&str> {
        if self.link_name_len == 0 {
            return None;
        }
        core::str::from_utf8(&self.link_name[..self.link_name_len as usize]).ok()
    }

    /// Whether `addr` falls inside the shared quantum region (as opposed
    /// to a process-local slab extent).
    fn in_quantum_region(&self, addr: u64) -> bool {
        addr >= self.region_base && addr < self.region_base + self.quantum_bytes
    }

    fn owning_quantum(&self, addr: u64) -> Option<&QuantumAllocator> {
        for &quantum in &self.quantum {
            let quantum = unsafe { &*quantum };
            if quantum.owns(addr) {
                return Some(quantum);
            }
        }
        None
    }

    fn slab_ref(&self) -> &SlabAllocator {
        unsafe { &*self.slab }
    }

    /// Whether this director manages `addr`.
    pub fn owns(&self, addr: u64) -> bool {
        self.owning_quantum(addr).is_some() || self.slab_ref().owns(addr)
    }

    /// Claim at least `size` bytes. Returns the base address, or 0.
    pub fn allocate(&self, size: u64) -> u64 {
        if size == 0 || size > MAX_ALLOCATION_SIZE {
            return 0;
        }
        let aligned = round_up_pow2(size.max(8));
        let order = size_to_order(aligned);
        match self.roster_entry(order) {
            AllocatorRef::Null => 0,
            AllocatorRef::Partition(partition) => unsafe {
                let partition = &*partition;
                (*partition.owner()).allocate_from_partition(partition, aligned)
            },
            AllocatorRef::Quantum(quantum) => unsafe { (*quantum).allocate(aligned) },
            AllocatorRef::Slab(slab) => unsafe { (*slab).allocate(aligned) },
        }
    }

    /// Release the allocation containing `addr`. Unknown addresses are a
    /// no-op.
    pub fn deallocate(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        if let Some(quantum) = self.owning_quantum(addr) {
            quantum.deallocate(addr);
            return;
        }
        if self.slab_ref().owns(addr) {
            self.slab_ref().deallocate(addr);
        }
    }

    /// Grow or shrink an allocation. On failure the old block is left
    /// intact and 0 is returned.
    pub fn reallocate(&self, addr: u64, new_size: u64) -> u64 {
        if addr == 0 {
            return self.allocate(new_size);
        }
        let old_size = self.allocated_size(addr);
        if old_size == 0 {
            return 0;
        }
        if new_size == 0 || new_size > MAX_ALLOCATION_SIZE {
            return 0;
        }
        let rounded = round_up_pow2(new_size.max(8));
        if old_size >= rounded && size_to_order(rounded) >= size_to_order(old_size) {
            return addr;
        }
        let new_addr = self.allocate(new_size);
        if new_addr == 0 {
            return 0;
        }
        os::copy(addr, new_addr, old_size.min(rounded));
        self.deallocate(addr);
        new_addr
    }

    /// Zero the allocation containing `addr`.
    pub fn clear(&self, addr: u64) {
        let size = self.allocated_size(addr);
        if size == 0 {
            return;
        }
        let shared = self.is_shared() && self.in_quantum_region(addr);
        os::zero(addr, size, shared);
    }

    /// Allocated size of the block containing `addr`, or 0.
    pub fn allocated_size(&self, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }
        if let Some(quantum) = self.owning_quantum(addr) {
            return quantum.allocated_size(addr);
        }
        self.slab_ref().allocated_size(addr)
    }

    /// Base of the live allocation containing `addr` (any interior
    /// pointer), or 0.
    pub fn allocation_base(&self, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }
        if let Some(quantum) = self.owning_quantum(addr) {
            return quantum.allocation_base(addr);
        }
        self.slab_ref().allocation_base(addr)
    }

    /// Side-data address of the allocation containing `addr`, or 0.
    pub fn side_data(&self, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }
        if let Some(quantum) = self.owning_quantum(addr) {
            return quantum.side_data_of(addr);
        }
        self.slab_ref().side_data_of(addr)
    }

    /// Walk live allocations: `next(0)` starts, each result feeds the
    /// next call, 0 ends. Order is component, then slot, then index.
    pub fn next_allocation(&self, prev: u64) -> u64 {
        let mut component = 0usize;
        if prev != 0 {
            let mut found = None;
            for (i, &quantum) in self.quantum.iter().enumerate() {
                if unsafe { &*quantum }.owns(prev) {
                    found = Some(i);
                    break;
                }
            }
            match found {
                Some(i) => {
                    let addr = unsafe { &*self.quantum[i] }.next_allocation(prev);
                    if addr != 0 {
                        return addr;
                    }
                    component = i + 1;
                }
                None => {
                    if !self.slab_ref().owns(prev) {
                        return 0;
                    }
                    return self.slab_ref().next_allocation(prev);
                }
            }
        }
        while component < QUANTUM_ALLOCATOR_COUNT {
            let addr = unsafe { &*self.quantum[component] }.next_allocation(0);
            if addr != 0 {
                return addr;
            }
            component += 1;
        }
        self.slab_ref().next_allocation(0)
    }

    /// Claim `count` contiguous blocks of `size` (a power of two).
    /// Returns the first block's address, or 0.
    pub fn allocate_count(&self, size: u64, count: u32) -> u64 {
        if size == 0 || count == 0 || !size.is_power_of_two() || size > MAX_ALLOCATION_SIZE {
            return 0;
        }
        let aligned = size.max(8);
        let order = size_to_order(aligned);
        match self.roster_entry(order) {
            AllocatorRef::Null => 0,
            AllocatorRef::Partition(partition) => unsafe {
                (*(*partition).owner()).allocate_count(aligned, count)
            },
            AllocatorRef::Quantum(quantum) => unsafe { (*quantum).allocate_count(aligned, count) },
            AllocatorRef::Slab(slab) => unsafe { (*slab).allocate_count(aligned, count) },
        }
    }

    /// Release `count` contiguous blocks of `size` starting at `addr`.
    pub fn deallocate_count(&self, addr: u64, size: u64, count: u32) {
        if addr == 0 || count == 0 {
            return;
        }
        if let Some(quantum) = self.owning_quantum(addr) {
            quantum.deallocate_count(addr, count);
            return;
        }
        if self.slab_ref().owns(addr) {
            self.slab_ref().deallocate_count(addr, size.max(8), count);
        }
    }

    /// Fill `out` with blocks of `size`. Contiguous mode returns
    /// `out.len()` ascending addresses spaced by the rounded size, or 0;
    /// sparse mode may return a partial count.
    pub fn allocate_bulk(&self, size: u64, out: &mut [u64], contiguous: bool) -> usize {
        if size == 0 || size > MAX_ALLOCATION_SIZE || out.is_empty() {
            return 0;
        }
        let aligned = round_up_pow2(size.max(8));
        let order = size_to_order(aligned);
        match self.roster_entry(order) {
            AllocatorRef::Null => 0,
            AllocatorRef::Partition(partition) => unsafe {
                (*(*partition).owner()).allocate_bulk(aligned, out, contiguous)
            },
            AllocatorRef::Quantum(quantum) => unsafe {
                (*quantum).allocate_bulk(aligned, out, contiguous)
            },
            AllocatorRef::Slab(slab) => unsafe { (*slab).allocate_bulk(aligned, out, contiguous) },
        }
    }

    /// Release a batch of addresses, grouped per owning component.
    pub fn deallocate_bulk(&self, addrs: &[u64]) {
        let mut k = 0;
        while k < addrs.len() {
            if addrs[k] == 0 {
                k += 1;
                continue;
            }
            if let Some(quantum) = self.owning_quantum(addrs[k]) {
                let mut j = k + 1;
                while j < addrs.len() && quantum.owns(addrs[j]) {
                    j += 1;
                }
                quantum.deallocate_bulk(&addrs[k..j]);
                k = j;
                continue;
            }
            if self.slab_ref().owns(addrs[k]) {
                self.slab_ref().deallocate(addrs[k]);
            }
            k += 1;
        }
    }

    /// Split an over-aligned request into equal smaller blocks to cut
    /// interior fragmentation. Returns block size and count when a split
    /// beats the single rounded block.
    fn fit_split(size: u64, degree: u32) -> Option<(u64, u32)> {
        let order = size_to_order(size);
        let low_order = order.saturating_sub(degree).max(SMALLEST_SIZE_ORDER);
        let rounded = align_up_u64(size, 1u64 << low_order);
        let scaled = rounded >> low_order;
        let zeros = ctz(scaled);
        let count = scaled >> zeros;
        if count > 1 {
            Some((1u64 << (low_order + zeros), count as u32))
        } else {
            None
        }
    }

    /// Claim at least `size` bytes with bounded interior fragmentation:
    /// `degree` extra orders of granularity, at the cost of allocating
    /// several contiguous smaller blocks.
    pub fn allocate_fit(&self, size: u64, degree: u32) -> u64 {
        if size == 0 || size > MAX_ALLOCATION_SIZE || !(1..=4).contains(&degree) {
            return 0;
        }
        match Self::fit_split(size, degree) {
            Some((block, count)) => self.allocate_count(block, count),
            None => self.allocate(size),
        }
    }

    /// Release an [`Director::allocate_fit`] allocation made with the
    /// same size and degree.
    pub fn deallocate_fit(&self, addr: u64, size: u64, degree: u32) {
        if addr == 0 || size == 0 || !(1..=4).contains(&degree) {
            return;
        }
        match Self::fit_split(size, degree) {
            Some((block, count)) => self.deallocate_count(addr, block, count),
            None => self.deallocate(addr),
        }
    }

    /// Fill the per-order census arrays. Slot 0 sums every other slot,
    /// slot 1 carries the components' structural footprints, slots 3..=48
    /// carry live allocation counts and byte totals per order.
    pub fn stats(&self, counts: &mut [u64; ORDER_COUNT], sizes: &mut [u64; ORDER_COUNT]) {
        counts.fill(0);
        sizes.fill(0);
        counts[STATS_SLOT_ADMIN] = 1 + QUANTUM_ALLOCATOR_COUNT as u64 + 1;
        sizes[STATS_SLOT_ADMIN] = self.admin_bytes;
        for &quantum in &self.quantum {
            let quantum = unsafe { &*quantum };
            sizes[STATS_SLOT_ADMIN] += quantum.admin_bytes();
            quantum.accumulate_stats(counts, sizes);
        }
        sizes[STATS_SLOT_ADMIN] += self.slab_ref().admin_bytes();
        self.slab_ref().accumulate_stats(counts, sizes);
        for slot in 1..ORDER_COUNT {
            counts[STATS_SLOT_TOTAL] += counts[slot];
            sizes[STATS_SLOT_TOTAL] += sizes[slot];
        }
    }

    /// User-reference slot: an atomic pointer-sized value the allocator
    /// itself never interprets.
    pub fn reference(&self) -> u64 {
        self.user_reference.load(Ordering::Acquire)
    }

    /// Compare-and-set the user reference. True on success.
    pub fn set_reference(&self, old: u64, new: u64) -> bool {
        self.user_reference
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts = [0u64; ORDER_COUNT];
        let mut sizes = [0u64; ORDER_COUNT];
        self.stats(&mut counts, &mut sizes);
        writeln!(f, "Director {{")?;
        writeln!(
            f,
            "    region: {:#x}..{:#x} ({:#x} quantum)",
            self.region_base,
            self.region_base + self.region_size,
            self.quantum_bytes
        )?;
        writeln!(f, "    flags: {:?}", self.flags)?;
        writeln!(
            f,
            "    admin: {} bytes across {} components",
            sizes[STATS_SLOT_ADMIN], counts[STATS_SLOT_ADMIN]
        )?;
        for order in SMALLEST_SIZE_ORDER..=MAX_ALLOCATION_ORDER {
            let order = order as usize;
            if counts[order] != 0 {
                writeln!(
                    f,
                    "    order {:>2}: {} live, {} bytes",
                    order, counts[order], sizes[order]
                )?;
            }
        }
        write!(f, "}}")
    }
}

/// Census snapshot, the two raw arrays plus derived accessors.
#[derive(Clone)]
pub struct DirectorStats {
    pub counts: [u64; ORDER_COUNT],
    pub sizes: [u64; ORDER_COUNT],
}

impl DirectorStats {
    /// Live allocations of the given order.
    pub fn live_at(&self, order: u32) -> u64 {
        self.counts[order as usize]
    }

    /// Total live bytes, administrative overhead excluded.
    pub fn live_bytes(&self) -> u64 {
        self.sizes[STATS_SLOT_TOTAL] - self.sizes[STATS_SLOT_ADMIN]
    }

    /// Structural footprint of the allocator itself.
    pub fn admin_bytes(&self) -> u64 {
        self.sizes[STATS_SLOT_ADMIN]
    }
}

/// Handle to a director. Cheap to copy out of `create`; the director
/// itself lives inside its own reservation.
pub struct Qba {
    director: *mut Director,
    shared_fd: i32,
}

unsafe impl Send for Qba {}
unsafe impl Sync for Qba {}

impl Qba {
    /// Create a director per `config`, with private or shared backing.
    pub fn create(config: &DirectorConfig) -> Result<Self, QbaError> {
        config.validate()?;
        let size = Director::required_size(config);
        match &config.link_name {
            Some(name) => Self::create_shared(config, name, size),
            None => Self::create_private(config, size),
        }
    }

    /// Create with the stock configuration and the given secure mode.
    pub fn create_default(secure: bool) -> Result<Self, QbaError> {
        Self::create(&DirectorConfig::secure(secure))
    }

    /// Reservation bytes `create` would take for this configuration.
    pub fn create_size(config: &DirectorConfig) -> Result<u64, QbaError> {
        config.validate()?;
        Ok(Director::required_size(config))
    }

    fn create_private(config: &DirectorConfig, size: u64) -> Result<Self, QbaError> {
        let base = if config.address != 0 {
            os::reserve_at(config.address, size)?
        } else {
            os::reserve_aligned(size, REGION_ALIGNMENT)?
        };
        match unsafe { Director::build(base, size, config) } {
            Ok(director) => Ok(Self {
                director,
                shared_fd: -1,
            }),
            Err(err) => {
                os::release(base, size);
                Err(err)
            }
        }
    }

    fn create_shared(config: &DirectorConfig, name: &str, size: u64) -> Result<Self, QbaError> {
        let (fd, created) = os::shared_create(name)?;
        if created {
            let result = os::shared_truncate(fd, size)
                .and_then(|()| os::map_shared(config.address, size, fd))
                .and_then(|base| unsafe { Director::build(base, size, config) });
            match result {
                Ok(director) => {
                    log::info!("shared object {} created ({:#x} bytes)", name, size);
                    Ok(Self {
                        director,
                        shared_fd: fd,
                    })
                }
                Err(err) => {
                    os::release(config.address, size);
                    os::shared_close(fd);
                    os::shared_unlink(name);
                    Err(err)
                }
            }
        } else {
            let base = match os::map_shared(config.address, size, fd) {
                Ok(base) => base,
                Err(err) => {
                    os::shared_close(fd);
                    return Err(err);
                }
            };
            // The director is the first metadata object; the layout is
            // deterministic for an identical configuration, so its
            // offset alone re-derives the handle.
            let geometries = Director::geometries(config);
            let director =
                (base + Director::quantum_region_bytes(&geometries)) as usize as *mut Director;
            if unsafe { (*director).region_base } != base {
                os::release(base, size);
                os::shared_close(fd);
                return Err(QbaError::InvalidConfiguration {
                    field: "link_name",
                    value: 0,
                    max: 0,
                });
            }
            log::info!("attached shared object {} at {:#x}", name, base);
            Ok(Self {
                director,
                shared_fd: fd,
            })
        }
    }

    /// The director this handle fronts.
    pub fn director(&self) -> &Director {
        unsafe { &*self.director }
    }

    /// Release everything: slab reservations, the whole region, the
    /// shared descriptor, and optionally the shared object's name.
    /// Unconditional; safe on partially used directors.
    pub fn destroy(self, unlink_shared: bool) {
        let director = unsafe { &*self.director };
        let base = director.region_base();
        let size = director.region_size();
        let shared = director.is_shared();
        let name = director.link_name_str().map(str::to_owned);
        director.slab_ref().release_all();
        os::release(base, size);
        if shared {
            os::shared_close(self.shared_fd);
            if unlink_shared {
                if let Some(name) = name {
                    os::shared_unlink(&name);
                }
            }
        }
    }

    /// Census snapshot.
    pub fn snapshot(&self) -> DirectorStats {
        let mut stats = DirectorStats {
            counts: [0; ORDER_COUNT],
            sizes: [0; ORDER_COUNT],
        };
        self.director().stats(&mut stats.counts, &mut stats.sizes);
        stats
    }

    pub fn allocate(&self, size: u64) -> u64 {
        self.director().allocate(size)
    }

    pub fn deallocate(&self, addr: u64) {
        self.director().deallocate(addr);
    }

    pub fn reallocate(&self, addr: u64, new_size: u64) -> u64 {
        self.director().reallocate(addr, new_size)
    }

    pub fn clear(&self, addr: u64) {
        self.director().clear(addr);
    }

    pub fn size(&self, addr: u64) -> u64 {
        self.director().allocated_size(addr)
    }

    pub fn base(&self, addr: u64) -> u64 {
        self.director().allocation_base(addr)
    }

    pub fn side_data(&self, addr: u64) -> u64 {
        self.director().side_data(addr)
    }

    pub fn next(&self, prev: u64) -> u64 {
        self.director().next_allocation(prev)
    }

    pub fn stats(&self, counts: &mut [u64; ORDER_COUNT], sizes: &mut [u64; ORDER_COUNT]) {
        self.director().stats(counts, sizes);
    }

    pub fn allocate_count(&self, size: u64, count: u32) -> u64 {
        self.director().allocate_count(size, count)
    }

    pub fn deallocate_count(&self, addr: u64, size: u64, count: u32) {
        self.director().deallocate_count(addr, size, count);
    }

    pub fn allocate_bulk(&self, size: u64, out: &mut [u64], contiguous: bool) -> usize {
        self.director().allocate_bulk(size, out, contiguous)
    }

    pub fn deallocate_bulk(&self, addrs: &[u64]) {
        self.director().deallocate_bulk(addrs);
    }

    pub fn allocate_fit(&self, size: u64, degree: u32) -> u64 {
        self.director().allocate_fit(size, degree)
    }

    pub fn deallocate_fit(&self, addr: u64, size: u64, degree: u32) {
        self.director().deallocate_fit(addr, size, degree);
    }

    pub fn reference(&self) -> u64 {
        self.director().reference()
    }

    pub fn set_reference(&self, old: u64, new: u64) -> bool {
        self.director().set_reference(old, new)
    }
}

impl fmt::Debug for Qba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.director(), f)
    }
}
