//! Fixed geometry of the allocator.
//!
//! Sizes are expressed as *orders* (base-2 logarithms). The quantum range
//! [`SMALLEST_SIZE_ORDER`, `LARGEST_QUANTUM_ORDER`] is split evenly across
//! the three quantum allocators; everything above it up to
//! [`MAX_ALLOCATION_ORDER`] is slab territory.

/// Smallest serviceable order: requests below 8 bytes round up to it.
pub const SMALLEST_SIZE_ORDER: u32 = 3;

/// Largest order served out of a partition (64 MiB).
pub const LARGEST_QUANTUM_ORDER: u32 = 26;

/// Largest serviceable order (256 TiB). Above this every request is null.
pub const MAX_ALLOCATION_ORDER: u32 = 48;

/// Largest serviceable size in bytes.
pub const MAX_ALLOCATION_SIZE: u64 = 1 << MAX_ALLOCATION_ORDER;

/// Number of roster entries (one per possible order).
pub const ORDER_COUNT: usize = 64;

/// Orders served by one quantum allocator (one order-registry each).
pub const ORDERS_PER_QUANTUM_ALLOCATOR: u32 = 8;

/// Small / medium / large.
pub const QUANTUM_ALLOCATOR_COUNT: usize = 3;

/// Hard cap on quanta per partition, and therefore on registry bits.
pub const MAX_PARTITION_QUANTA: u32 = 16384;

/// Hard cap on partition slots per quantum allocator and on slab slots.
pub const MAX_COMPONENT_SLOTS: u32 = 16384;

/// Hard cap on per-allocation side data.
pub const MAX_SIDE_DATA_SIZE: u32 = 64;

/// Partition size orders per region. Each divides the region alignment
/// (the largest quantum size), so carving regions largest-to-smallest
/// keeps every partition base naturally aligned to its own size.
pub const PARTITION_SIZE_ORDERS: [u32; QUANTUM_ALLOCATOR_COUNT] = [17, 24, 26];

/// First order served by each region: small 3..=10, medium 11..=18,
/// large 19..=26.
pub const REGION_SMALLEST_ORDERS: [u32; QUANTUM_ALLOCATOR_COUNT] = [
    SMALLEST_SIZE_ORDER,
    SMALLEST_SIZE_ORDER + ORDERS_PER_QUANTUM_ALLOCATOR,
    SMALLEST_SIZE_ORDER + 2 * ORDERS_PER_QUANTUM_ALLOCATOR,
];

/// Alignment of the whole reservation and of slab extents.
pub const REGION_ALIGNMENT: u64 = 1 << LARGEST_QUANTUM_ORDER;

/// Slab extents round up to this grain (1 MiB).
pub const SLAB_SIZE_GRAIN: u64 = 1 << 20;

/// Threshold below which `zero` writes bytes instead of resetting pages.
pub const ZERO_WRITE_LIMIT: u64 = 32 * 1024;

/// Longest accepted shared-object link name, including the NUL.
pub const MAX_LINK_NAME: usize = 64;

/// Stats slot holding the sum of all other slots.
pub const STATS_SLOT_TOTAL: usize = 0;

/// Stats slot holding administrative (structural) footprints.
pub const STATS_SLOT_ADMIN: usize = 1;
