//! Director configuration and validation.

use bitflags::bitflags;

use crate::constants::{MAX_COMPONENT_SLOTS, MAX_LINK_NAME, MAX_SIDE_DATA_SIZE, REGION_ALIGNMENT};
use crate::error::QbaError;

bitflags! {
    /// Mode flags a director runs under, echoed into every component.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirectorFlags: u32 {
        /// Zero memory on the deallocate path before it becomes reusable.
        const SECURE = 1 << 0;
        /// The whole reservation lives in a named shared-memory object.
        const SHARED = 1 << 1;
    }
}

/// Everything `create` needs. [`DirectorConfig::default`] matches the
/// stock single-process configuration; [`DirectorConfig::secure`] is the
/// usual entry point.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Fixed mapping address, or 0 to let the OS choose. Shared mode
    /// requires a nonzero, region-aligned address identical in every
    /// participating process.
    pub address: u64,
    /// Name of the shared-memory object; `None` selects private backing.
    pub link_name: Option<String>,
    /// Zero deallocated memory before reuse.
    pub secure: bool,
    /// Partition slots of the small region (orders 3..=10).
    pub small_partitions: u32,
    /// Partition slots of the medium region (orders 11..=18).
    pub medium_partitions: u32,
    /// Partition slots of the large region (orders 19..=26).
    pub large_partitions: u32,
    /// Slab slots (orders 27..=48).
    pub max_slabs: u32,
    /// Per-allocation side data bytes, 0 to disable.
    pub side_data_size: u32,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            address: 0,
            link_name: None,
            secure: false,
            small_partitions: 32,
            medium_partitions: 16,
            large_partitions: 8,
            max_slabs: 2048,
            side_data_size: 0,
        }
    }
}

impl DirectorConfig {
    /// Stock configuration with the given secure mode.
    pub fn secure(secure: bool) -> Self {
        Self {
            secure,
            ..Self::default()
        }
    }

    pub fn flags(&self) -> DirectorFlags {
        let mut flags = DirectorFlags::empty();
        if self.secure {
            flags |= DirectorFlags::SECURE;
        }
        if self.link_name.is_some() {
            flags |= DirectorFlags::SHARED;
        }
        flags
    }

    /// Reject out-of-domain parameters before any side effect.
    pub fn validate(&self) -> Result<(), QbaError> {
        let counts = [
            ("small_partitions", self.small_partitions),
            ("medium_partitions", self.medium_partitions),
            ("large_partitions", self.large_partitions),
            ("max_slabs", self.max_slabs),
        ];
        for (field, value) in counts {
            if value > MAX_COMPONENT_SLOTS {
                return Err(QbaError::InvalidConfiguration {
                    field,
                    value: value as u64,
                    max: MAX_COMPONENT_SLOTS as u64,
                });
            }
        }
        if self.side_data_size > MAX_SIDE_DATA_SIZE {
            return Err(QbaError::InvalidConfiguration {
                field: "side_data_size",
                value: self.side_data_size as u64,
                max: MAX_SIDE_DATA_SIZE as u64,
            });
        }
        if let Some(name) = &self.link_name {
            if name.is_empty() || name.len() >= MAX_LINK_NAME || name.as_bytes().contains(&0) {
                return Err(QbaError::InvalidConfiguration {
                    field: "link_name",
                    value: name.len() as u64,
                    max: (MAX_LINK_NAME - 1) as u64,
                });
            }
            if self.address == 0 || self.address % REGION_ALIGNMENT != 0 {
                return Err(QbaError::InvalidConfiguration {
                    field: "address",
                    value: self.address,
                    max: 0,
                });
            }
            if !crate::os::supports_sharing() {
                return Err(QbaError::ShareUnsupported);
            }
        }
        if self.address % REGION_ALIGNMENT != 0 {
            return Err(QbaError::InvalidConfiguration {
                field: "address",
                value: self.address,
                max: 0,
            });
        }
        Ok(())
    }
}
