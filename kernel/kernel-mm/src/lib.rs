//! # Per-Process Memory Management
//!
//! [`MemorySpace`] ties one page-table tree to the list of virtual memory
//! areas (VMAs) mapped into it. The VMA list is the policy layer: regions
//! never overlap, `munmap` only tears down whole regions, and both
//! teardown paths widen the range handed to the page-table code out to the
//! nearest remaining neighbor, so intermediate tables become reclaimable
//! without per-table reference counts.
//!
//! `mset`/`mcopy` reach mapped bytes purely through address translation
//! and the physical mapper; nothing here touches a live TLB.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod space;
mod vma;

pub use space::MemorySpace;
pub use vma::{Vma, VmaFlags};

use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapError;

/// Region installation failure. The space is unchanged on every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmapError {
    /// The range extends beyond the user address boundary.
    #[error("range extends beyond the user boundary")]
    OutOfBounds,
    /// Bounds reversed or not page-aligned.
    #[error("bounds reversed or not page-aligned")]
    Unaligned,
    /// The range overlaps an existing region.
    #[error("range overlaps an existing region")]
    Overlap,
    /// A VMA record or a physical block could not be allocated.
    #[error("out of physical memory")]
    OutOfMemory,
}

impl From<MapError> for MmapError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::AlreadyMapped(_) => Self::Overlap,
            MapError::InvalidRange => Self::Unaligned,
        }
    }
}

/// Region teardown failure. The space is unchanged on every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MunmapError {
    /// Bounds reversed or not page-aligned.
    #[error("bounds reversed or not page-aligned")]
    Unaligned,
    /// The range cuts through a region instead of covering it whole;
    /// splitting a region is not supported.
    #[error("range partially covers a region")]
    PartialCoverage,
}

/// `mset`/`mcopy` failure: the walk hit an unmapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),
}
