//! Freestanding helpers shared across the QBA workspace.
//!
//! Everything in this crate is `no_std`, allocation-free and side-effect
//! free, so it can be used from the allocator core without ordering
//! concerns.

#![no_std]

pub mod alignment;
pub mod bits;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use bits::{
    NOT_FOUND, clz, ctz, low_zero_bit, low_zero_run_pos, round_up_pow2, size_of_order,
    size_to_order,
};
