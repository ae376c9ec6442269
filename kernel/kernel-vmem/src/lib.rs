//! # Virtual Memory Support
//!
//! 4-level x86-64 paging for the kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] rooted at an L4 table, with recursive
//!   `map_range` / `map_to` / `unmap_range` / `translate`.
//! - A raw 64-bit [`PageEntryBits`] bitfield shared by all levels.
//! - A 4 KiB-aligned [`PageTable`] wrapper plus [`Level`] index helpers.
//! - The allocator/mapper seams ([`FrameSource`], [`PhysMapper`]).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |   L4  |   L3  |   L2  |   L1  | Offset |
//! ```
//!
//! The CPU uses these fields as indices into four levels of page tables,
//! each holding 512 entries of 8 bytes. An entry either points at the next
//! table down or, with the PS bit at L3/L2 (or always at L1), maps a
//! physical page directly — 1 GiB, 2 MiB or 4 KiB depending on where the
//! walk stops. The final offset selects the byte inside the leaf page.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
mod page_table;

extern crate alloc;

pub use crate::address_space::{AddressSpace, KERNEL_L4_START, RootPage};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{ENTRY_COUNT, Level, PageTable};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of physical memory blocks for page tables and leaf pages.
///
/// `order` counts frames logarithmically: an order-`n` block is `2^n`
/// contiguous, naturally aligned 4 KiB frames. Table frames are order 0;
/// large leaves are order 9 (2 MiB) and 18 (1 GiB).
///
/// Takes `&self`: implementations lock internally so one source can serve
/// page tables, object caches and thread stacks concurrently.
pub trait FrameSource {
    /// Allocate a naturally aligned block of `2^order` frames.
    /// Returns `None` on exhaustion.
    fn alloc_frames(&self, order: u32) -> Option<PhysicalPage<Size4K>>;

    /// Return a block obtained from [`alloc_frames`](Self::alloc_frames)
    /// with the same `order`.
    fn free_frames(&self, block: PhysicalPage<Size4K>, order: u32);
}

/// Converts physical addresses to *temporarily* usable pointers in the
/// current virtual address space (e.g., via identity map or a fixed-offset
/// physical window).
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable pointer in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Per-crate error type for mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The frame source ran dry.
    #[error("out of physical memory")]
    OutOfMemory,
    /// A present leaf was found inside the requested range.
    #[error("address {0} is already mapped")]
    AlreadyMapped(kernel_memory_addresses::VirtualAddress),
    /// Bounds reversed or not frame-aligned.
    #[error("invalid or unaligned range")]
    InvalidRange,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::Cell;
    use kernel_memory_addresses::{PageSize, Size2M, VirtualAddress};

    /// A 4 KiB-aligned raw frame; the "physical RAM" backing store.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated physical memory: a vector of 4 KiB-aligned frames with
    /// physical addresses counted from 0, plus an identity-window mapper.
    /// Only for tests; real mappers honor the actual physical window.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K([0u8; 4096]));
            }
            Self { frames: v }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            // Page tables always sit at frame starts.
            debug_assert_eq!(off, 0);
            debug_assert!(idx < self.frames.len());
            // The frames are contiguous in the vector; deriving the pointer
            // from `as_ptr` (not from a `&` to one element) keeps the whole
            // backing store in its provenance.
            let ptr = unsafe { self.frames.as_ptr().cast::<u8>().cast_mut().add(idx << 12) };
            // SAFETY: the caller promises `T` matches the bytes there.
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    /// Bump allocator over the simulated RAM: aligns up to the block size,
    /// counts frees instead of reusing them.
    struct BumpSource {
        next: Cell<u64>,
        end: u64,
        freed_frames: Cell<u64>,
    }

    impl BumpSource {
        fn new(frames: u64) -> Self {
            Self {
                next: Cell::new(0),
                end: frames << 12,
                freed_frames: Cell::new(0),
            }
        }

        fn used_frames(&self) -> u64 {
            self.next.get() >> 12
        }
    }

    impl FrameSource for BumpSource {
        fn alloc_frames(&self, order: u32) -> Option<PhysicalPage<Size4K>> {
            let size = 4096u64 << order;
            let base = (self.next.get() + size - 1) & !(size - 1);
            if base + size > self.end {
                return None;
            }
            self.next.set(base + size);
            Some(PhysicalAddress::new(base).page())
        }

        fn free_frames(&self, _block: PhysicalPage<Size4K>, order: u32) {
            self.freed_frames.set(self.freed_frames.get() + (1 << order));
        }
    }

    fn fresh_space<'m>(
        phys: &'m TestPhys,
        frames: &BumpSource,
    ) -> AddressSpace<'m, TestPhys> {
        AddressSpace::create(phys, frames).expect("root table")
    }

    fn rw() -> PageEntryBits {
        PageEntryBits::new().with_writable(true).with_user_access(true)
    }

    #[test]
    fn map_one_frame_builds_the_chain() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(64);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        space
            .map_range(&frames, va, va + 4096, rw())
            .expect("map_range");

        // Walk the chain by hand: L4 → L3 → L2 → L1 leaf.
        let mut table = space.root_page();
        for level in [Level::L4, Level::L3, Level::L2] {
            let e = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
                .get(level.index_of(va));
            assert!(e.present());
            assert!(!e.large_page());
            table = e.physical_address().page();
        }
        let leaf = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
            .get(Level::L1.index_of(va));
        assert!(leaf.present());
        assert!(leaf.writable());
        assert!(leaf.user_access());

        // Root + 3 intermediate tables + 1 leaf frame.
        assert_eq!(frames.used_frames(), 5);
    }

    #[test]
    fn aligned_2m_span_becomes_a_large_leaf() {
        let phys = TestPhys::with_frames(64);
        // Plenty of simulated space; the leaf block is just a number here.
        let frames = BumpSource::new(1 << 12);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_6000_0020_0000);
        space
            .map_range(&frames, va, va + Size2M::SIZE, rw())
            .expect("map_range");

        let mut table = space.root_page();
        for level in [Level::L4, Level::L3] {
            let e = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
                .get(level.index_of(va));
            assert!(e.present());
            table = e.physical_address().page();
        }
        let e2 = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
            .get(Level::L2.index_of(va));
        assert!(e2.present());
        assert!(e2.large_page(), "expected a 2 MiB leaf");
    }

    #[test]
    fn unaligned_2m_span_tiles_with_4k_leaves() {
        let phys = TestPhys::with_frames(600);
        let frames = BumpSource::new(600);
        let space = fresh_space(&phys, &frames);

        // 2 MiB worth of pages, but starting 4 KiB past the boundary.
        let va = VirtualAddress::new(0x0000_6000_0020_1000);
        space
            .map_range(&frames, va, va + Size2M::SIZE, rw())
            .expect("map_range");

        // Both boundary pages translate, so they were mapped as 4K.
        assert!(space.translate(va).is_some());
        assert!(space.translate(va + (Size2M::SIZE - 4096)).is_some());
        // The 2 MiB-aligned hole before `va` stayed unmapped.
        assert!(space.translate(VirtualAddress::new(0x0000_6000_0020_0000)).is_none());
    }

    #[test]
    fn translate_follows_offsets_through_leaf_sizes() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(1 << 12);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_1234_5600_0000);
        // Map a contiguous physical window so translation is predictable.
        let pa = PhysicalAddress::new(0x0000_0000_4000_0000);
        space
            .map_to(&frames, va, va + Size2M::SIZE, pa, rw())
            .expect("map_to");

        let probe = va + 0x12_3456;
        assert_eq!(
            space.translate(probe),
            Some(PhysicalAddress::new(pa.as_u64() + 0x12_3456))
        );
        assert_eq!(space.translate(va + Size2M::SIZE), None);
    }

    #[test]
    fn map_to_requires_physical_alignment_for_large_leaves() {
        let phys = TestPhys::with_frames(600);
        let frames = BumpSource::new(600);
        let space = fresh_space(&phys, &frames);

        // VA span is 2 MiB-aligned but PA is off by one frame: must tile
        // with 4 KiB leaves, not produce a misaligned large leaf.
        let va = VirtualAddress::new(0x0000_6000_0040_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0000_1000);
        space
            .map_to(&frames, va, va + Size2M::SIZE, pa, rw())
            .expect("map_to");

        assert_eq!(space.translate(va), Some(pa));
        let mut table = space.root_page();
        for level in [Level::L4, Level::L3] {
            let e = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
                .get(level.index_of(va));
            table = e.physical_address().page();
        }
        let e2 = unsafe { phys.phys_to_mut::<PageTable>(table.base()) }
            .get(Level::L2.index_of(va));
        assert!(e2.present());
        assert!(!e2.large_page(), "misaligned PA must not form a 2M leaf");
    }

    #[test]
    fn mapping_over_a_leaf_is_rejected() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(64);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        space.map_range(&frames, va, va + 4096, rw()).expect("first");
        let err = space.map_range(&frames, va, va + 4096, rw()).unwrap_err();
        assert_eq!(err, MapError::AlreadyMapped(va));
    }

    #[test]
    fn unmap_returns_leaves_and_reclaims_tables() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(64);
        let space = fresh_space(&phys, &frames);

        // 512 GiB-aligned base: the range below covers a whole L4 entry.
        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        space
            .map_range(&frames, va, va + 4 * 4096, rw())
            .expect("map_range");
        let used = frames.used_frames(); // root + 3 tables + 4 leaves

        // Unmapping just the pages returns the leaves but must keep the
        // table chain: the span does not cover any table's full reach.
        space.unmap_range(&frames, va, va + 4 * 4096);
        assert_eq!(frames.freed_frames.get(), 4);
        assert!(space.translate(va).is_none());

        // Unmapping the covering span reclaims the whole subtree; only the
        // root survives. This is the span a widened teardown passes down.
        space.unmap_range(&frames, va, VirtualAddress::new(va.as_u64() + Level::L4.entry_span()));
        assert_eq!(frames.freed_frames.get(), used - 1);

        let e4 = unsafe { phys.phys_to_mut::<PageTable>(space.root_page().base()) }
            .get(Level::L4.index_of(va));
        assert!(!e4.present());
    }

    #[test]
    fn partial_unmap_keeps_siblings_mapped() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(64);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        space
            .map_range(&frames, va, va + 4 * 4096, rw())
            .expect("map_range");

        space.unmap_range(&frames, va + 4096, va + 2 * 4096);

        assert!(space.translate(va).is_some());
        assert!(space.translate(va + 4096).is_none());
        assert!(space.translate(va + 2 * 4096).is_some());
        assert!(space.translate(va + 3 * 4096).is_some());
        // Only the single leaf frame came back.
        assert_eq!(frames.freed_frames.get(), 1);
    }

    #[test]
    fn adopt_kernel_half_shares_upper_entries() {
        let phys = TestPhys::with_frames(64);
        let frames = BumpSource::new(64);
        let template = fresh_space(&phys, &frames);

        let kva = VirtualAddress::new(0xFFFF_8000_0000_0000);
        template
            .map_range(&frames, kva, kva + 4096, PageEntryBits::new().with_writable(true))
            .expect("kernel map");

        let space = fresh_space(&phys, &frames);
        space.adopt_kernel_half(template.root_page());

        // The new space resolves kernel VAs through the shared subtree.
        assert_eq!(space.translate(kva), template.translate(kva));
        // And the lower half stays empty.
        assert!(space.translate(VirtualAddress::new(0x1000)).is_none());
    }

    #[test]
    fn empty_and_invalid_ranges() {
        let phys = TestPhys::with_frames(8);
        let frames = BumpSource::new(8);
        let space = fresh_space(&phys, &frames);

        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        // Empty range: no-op success, no allocations beyond the root.
        space.map_range(&frames, va, va, rw()).expect("empty");
        assert_eq!(frames.used_frames(), 1);

        // Unaligned and reversed bounds are rejected.
        assert_eq!(
            space.map_range(&frames, va + 1, va + 4096, rw()),
            Err(MapError::InvalidRange)
        );
        assert_eq!(
            space.map_range(&frames, va + 4096, va, rw()),
            Err(MapError::InvalidRange)
        );
    }
}
