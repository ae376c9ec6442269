use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level (9 index bits).
pub const ENTRY_COUNT: usize = 512;

/// One of the four paging levels, L4 (root) down to L1 (4 KiB leaves).
///
/// The same 512-entry table shape repeats at every level; only the span an
/// entry covers differs. Index bits per level:
///
/// ```text
/// VA = [L4:9] [L3:9] [L2:9] [L1:9] [offset:12]
///       bit 39 bit 30 bit 21 bit 12
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    L1,
    L2,
    L3,
    L4,
}

impl Level {
    /// Bit position of this level's index field within a VA.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L1 => 12,
            Self::L2 => 21,
            Self::L3 => 30,
            Self::L4 => 39,
        }
    }

    /// Bytes of VA space covered by **one entry** at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Bytes of VA space covered by the **whole table** at this level.
    #[inline]
    #[must_use]
    pub const fn table_span(self) -> u64 {
        self.entry_span() * ENTRY_COUNT as u64
    }

    /// This level's index within `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & (ENTRY_COUNT as u64 - 1)) as usize
    }

    /// The level an entry at this level points down to. `None` at L1.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
            Self::L4 => Some(Self::L3),
        }
    }

    /// Whether the hardware allows a leaf (PS=1) at this level.
    #[inline]
    #[must_use]
    pub const fn supports_large_leaf(self) -> bool {
        matches!(self, Self::L2 | Self::L3)
    }

    /// Buddy order of the physical block backing a leaf at this level
    /// (0 at L1, 9 at L2, 18 at L3).
    #[inline]
    #[must_use]
    pub const fn leaf_frame_order(self) -> u32 {
        self.shift() - Self::L1.shift()
    }
}

/// A 4 KiB-aligned page table: 512 raw entries. The same shape serves all
/// four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRY_COUNT],
}

impl PageTable {
    /// Clear every entry (not-present).
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); ENTRY_COUNT];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Whether any entry is present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
