use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This models the **common superset** of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE). An entry either points to a next-level
/// table or, with `large_page` (PS) set at L3/L2 — or always at L1 — maps a
/// physical page directly.
///
/// ### Bit layout
///
/// | Bits  | Name          | Meaning |
/// |-------|---------------|---------|
/// | 0     | `P`           | Valid entry if set |
/// | 1     | `RW`          | Writable if set |
/// | 2     | `US`          | User-mode accessible if set |
/// | 3     | `PWT`         | Write-through caching |
/// | 4     | `PCD`         | Disable caching |
/// | 5     | `A`           | Accessed |
/// | 6     | `D`           | Dirty (leaf only) |
/// | 7     | `PS`          | Large-page flag (L3/L2 only) |
/// | 8     | `G`           | Global (leaf only) |
/// | 9–11  | OS avail low  | Reserved for OS use |
/// | 12–51 | `frame`       | Physical frame bits [51:12] |
/// | 52–58 | OS avail high | Reserved for OS use |
/// | 59–62 | `PKU`         | Protection key or OS use |
/// | 63    | `NX`          | Execute disable |
///
/// Non-leaf entries ignore `D`, `G` and the PS bit must be clear in L4/L1
/// entries. The physical address field omits the low 12 bits, which are
/// implicitly zero due to alignment; a large-page base simply leaves the
/// extra low frame bits zero.
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow user-mode access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6) — leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// For L3 (PDPTE) and L2 (PDE): when set, the entry is a leaf mapping a
    /// 1 GiB (L3) or 2 MiB (L2) page. When clear, the entry points at the
    /// next-level table. Must be clear for L4 and L1.
    pub large_page: bool,

    /// Global (G, bit 8) — leaf only. Survives CR3 reloads when CR4.PGE.
    pub global: bool,

    /// OS-available bits 9–11.
    #[bits(3)]
    pub os_low: u8,

    /// Physical frame number, bits 12–51 of the entry.
    #[bits(40)]
    frame: u64,

    /// OS-available bits 52–58.
    #[bits(7)]
    pub os_high: u8,

    /// Protection key (59–62), or OS use when PKU is unsupported.
    #[bits(4)]
    pub protection_key: u8,

    /// No-execute (NX, bit 63). Honored when EFER.NXE is set.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// The physical base address this entry refers to (next-level table
    /// frame, or leaf page base).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << Size4K::SHIFT)
    }

    /// Store a physical base address. Low 12 bits must be zero.
    #[inline]
    pub fn set_physical_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_aligned::<Size4K>(), "entry target not frame aligned");
        self.set_frame(pa.as_u64() >> Size4K::SHIFT);
    }

    /// Builder-style variant of [`set_physical_address`](Self::set_physical_address).
    #[inline]
    #[must_use]
    pub fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_aligned::<Size4K>(), "entry target not frame aligned");
        self.with_frame(pa.as_u64() >> Size4K::SHIFT)
    }

    /// Whether this entry is a leaf at `level` (always at L1, `PS` above).
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(self, level: crate::Level) -> bool {
        matches!(level, crate::Level::L1) || self.large_page()
    }
}
