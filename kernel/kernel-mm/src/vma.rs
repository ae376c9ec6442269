//! Virtual memory area records.

use bitflags::bitflags;
use kernel_memory_addresses::VirtualAddress;

bitflags! {
    /// Access permissions of one region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One mapped region: `[begin, end)` at `flags`. Records are flat values
/// served out of a slab cache; the owning space keeps them sorted by
/// `begin` and non-overlapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Vma {
    pub begin: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmaFlags,
}

impl Vma {
    /// Region length in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.begin.as_u64()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin.as_u64() == self.end.as_u64()
    }
}
