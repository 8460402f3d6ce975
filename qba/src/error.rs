//! Unified error type for the allocator.
//!
//! Errors are strictly local values; nothing in the crate panics across
//! the public boundary. Pointer-returning operations keep their null/zero
//! sentinel contract, so this enum surfaces only from construction and
//! configuration paths.

use core::fmt;

/// Unified allocator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QbaError {
    /// The OS refused a reservation or mapping of the requested size.
    OutOfAddressSpace,
    /// Every partition slot at the requested order is full and no empty
    /// slot could be repurposed.
    OutOfCapacity,
    /// A configuration parameter is outside its stated domain.
    InvalidConfiguration {
        field: &'static str,
        value: u64,
        max: u64,
    },
    /// The address is not managed by this director.
    InvalidAddress { address: u64 },
    /// An OS mapping call failed with the given raw error code.
    MapFailed { code: i32 },
    /// Shared mode was requested on a platform without named mappings.
    ShareUnsupported,
}

impl fmt::Display for QbaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfAddressSpace => write!(f, "address space reservation refused"),
            Self::OutOfCapacity => write!(f, "all partition slots exhausted"),
            Self::InvalidConfiguration { field, value, max } => {
                write!(f, "configuration field {} = {} exceeds {}", field, value, max)
            }
            Self::InvalidAddress { address } => {
                write!(f, "address {:#x} is not managed here", address)
            }
            Self::MapFailed { code } => write!(f, "mapping call failed (os error {})", code),
            Self::ShareUnsupported => {
                write!(f, "shared backing is not supported on this platform")
            }
        }
    }
}

impl core::error::Error for QbaError {}
