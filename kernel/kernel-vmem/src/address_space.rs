//! # Address Space (x86-64, 4-level radix tree)
//!
//! Helpers to build and manipulate a **single** virtual address space
//! rooted at an L4 table. The same 512-entry table shape repeats at every
//! level, so mapping, unmapping and translation are one recursion each,
//! parameterized by [`Level`].
//!
//! ## Design
//!
//! - Leaves sit at L1 (4 KiB) always, or at L2/L3 (2 MiB / 1 GiB) when an
//!   entry's whole span lies inside the requested range and the backing is
//!   suitably aligned. Large leaves never split a request: the recursion
//!   only takes them when they fit exactly.
//! - Physical backing comes from a [`FrameSource`]; table frames are always
//!   single frames, leaf blocks are `2^(9*level)` frames.
//! - Unmapping returns leaf blocks to the frame source and reclaims an
//!   intermediate table as soon as the unmapped span covers the table's
//!   entire reach.
//! - `unsafe` stays confined to viewing a physical frame as a typed table
//!   through the [`PhysMapper`].
//!
//! ## Safety
//!
//! Mutating a *live* address space requires TLB maintenance (`invlpg` or a
//! CR3 reload); that is the caller's business, as is making sure the
//! mapper yields writable references to table frames.

use crate::page_table::{ENTRY_COUNT, Level, PageTable};
use crate::{FrameSource, MapError, PageEntryBits, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>, // L4 frame
    mapper: &'m M,
}

/// The L4 root page of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// L4 index where the kernel half begins (VA bit 47 and up set).
pub const KERNEL_L4_START: usize = ENTRY_COUNT / 2;

/// How a mapped range is backed.
#[derive(Copy, Clone)]
enum Backing {
    /// Every leaf gets a freshly allocated block of the leaf's order.
    Allocate,
    /// The range is a window onto `[base_pa + (va - base_va)]`.
    Linear {
        base_va: VirtualAddress,
        base_pa: PhysicalAddress,
    },
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a fresh root table.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available.
    pub fn create<F: FrameSource>(mapper: &'m M, frames: &F) -> Result<Self, MapError> {
        let root = alloc_table(mapper, frames)?;
        Ok(Self { root, mapper })
    }

    /// Wrap an existing root frame (e.g. the boot tables).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the L4 table.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Copy the kernel-half L4 entries (indices 256..512) from `template`.
    ///
    /// Every space shares the kernel's upper-half subtrees by aliasing the
    /// template's L3 tables; only the entries are copied, never the trees.
    pub fn adopt_kernel_half(&self, template: RootPage) {
        let src = table_mut(self.mapper, template);
        let dst = table_mut(self.mapper, self.root);
        for idx in KERNEL_L4_START..ENTRY_COUNT {
            dst.set(idx, src.get(idx));
        }
    }

    /// Map `[from, to)` with freshly allocated physical blocks.
    ///
    /// Large leaves (2 MiB / 1 GiB) are chosen greedily wherever an entry's
    /// span lies fully inside the range; fresh blocks from the frame source
    /// are naturally aligned, so only the virtual span decides.
    ///
    /// On failure the mappings installed so far remain in place; the caller
    /// compensates with [`unmap_range`](Self::unmap_range) over the same
    /// (or a wider) range.
    ///
    /// # Errors
    /// [`MapError::InvalidRange`] for unaligned or reversed bounds,
    /// [`MapError::AlreadyMapped`] when a leaf exists inside the range,
    /// [`MapError::OutOfMemory`] when the frame source runs dry.
    pub fn map_range<F: FrameSource>(
        &self,
        frames: &F,
        from: VirtualAddress,
        to: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        check_range(from, to)?;
        if from == to {
            return Ok(());
        }
        self.map_level(frames, Level::L4, self.root, from, to, Backing::Allocate, flags)
    }

    /// Map `[from, to)` onto the contiguous physical range starting at `pa`.
    ///
    /// Same greedy leaf selection as [`map_range`](Self::map_range), except
    /// a large leaf additionally requires the physical side to share the
    /// leaf's alignment.
    ///
    /// # Errors
    /// As for [`map_range`](Self::map_range); `pa` must be frame-aligned.
    pub fn map_to<F: FrameSource>(
        &self,
        frames: &F,
        from: VirtualAddress,
        to: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        check_range(from, to)?;
        if !pa.is_aligned::<Size4K>() {
            return Err(MapError::InvalidRange);
        }
        if from == to {
            return Ok(());
        }
        let backing = Backing::Linear {
            base_va: from,
            base_pa: pa,
        };
        self.map_level(frames, Level::L4, self.root, from, to, backing, flags)
    }

    /// Unmap `[from, to)`, returning leaf blocks to `frames` and freeing
    /// every intermediate table whose whole span lies inside the range.
    ///
    /// Holes are skipped, so the same range can be unmapped twice and a
    /// partially failed map can be torn down. The bounds must be
    /// frame-aligned; a large leaf must be covered entirely (the layer
    /// above guarantees this by unmapping whole regions).
    pub fn unmap_range<F: FrameSource>(
        &self,
        frames: &F,
        from: VirtualAddress,
        to: VirtualAddress,
    ) {
        debug_assert!(from.is_aligned::<Size4K>() && to.is_aligned::<Size4K>());
        if from >= to {
            return;
        }
        self.unmap_level(frames, Level::L4, self.root, from, to);
    }

    /// Translate a VA to a PA if mapped, honoring leaves at any level.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut level = Level::L4;
        let mut table = self.root;
        loop {
            let entry = table_mut(self.mapper, table).get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if entry.is_leaf_at(level) {
                let offset = va.as_u64() & (level.entry_span() - 1);
                return Some(entry.physical_address() + offset);
            }
            table = entry.physical_address().page();
            level = level.child()?;
        }
    }

    /// Free the (now empty) root table. Call after unmapping everything the
    /// space owns; shared kernel-half subtrees are *not* traversed.
    pub fn release_root<F: FrameSource>(self, frames: &F) {
        frames.free_frames(self.root, 0);
    }

    fn map_level<F: FrameSource>(
        &self,
        frames: &F,
        level: Level,
        table: PhysicalPage<Size4K>,
        from: VirtualAddress,
        to: VirtualAddress,
        backing: Backing,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let span = level.entry_span();
        let mut cur = from;
        while cur < to {
            let idx = level.index_of(cur);
            let entry_base = cur.as_u64() & !(span - 1);
            let entry_end = VirtualAddress::new((entry_base + span).min(to.as_u64()));
            let whole = cur.as_u64() == entry_base && entry_end.as_u64() - entry_base == span;

            if self.try_leaf(frames, level, table, idx, cur, whole, backing, flags)? {
                cur = entry_end;
                continue;
            }

            if let Some(child_level) = level.child() {
                let child = self.ensure_child(frames, table, idx, cur, flags)?;
                self.map_level(frames, child_level, child, cur, entry_end, backing, flags)?;
            }
            cur = entry_end;
        }
        Ok(())
    }

    /// Install a leaf at `table[idx]` if this level/position allows one.
    /// Returns `Ok(false)` when the walk must descend instead.
    #[allow(clippy::too_many_arguments)]
    fn try_leaf<F: FrameSource>(
        &self,
        frames: &F,
        level: Level,
        table: PhysicalPage<Size4K>,
        idx: usize,
        cur: VirtualAddress,
        whole: bool,
        backing: Backing,
        flags: PageEntryBits,
    ) -> Result<bool, MapError> {
        let span = level.entry_span();
        let leaf_pa = match (level, backing) {
            (Level::L1, Backing::Allocate) => None,
            (Level::L1, Backing::Linear { base_va, base_pa }) => {
                Some(base_pa + (cur.as_u64() - base_va.as_u64()))
            }
            (_, _) if !level.supports_large_leaf() || !whole => return Ok(false),
            (_, Backing::Allocate) => None,
            (_, Backing::Linear { base_va, base_pa }) => {
                let pa = base_pa + (cur.as_u64() - base_va.as_u64());
                if pa.as_u64() & (span - 1) != 0 {
                    // Virtual span fits but physical side is misaligned.
                    return Ok(false);
                }
                Some(pa)
            }
        };

        if table_mut(self.mapper, table).get(idx).present() {
            return Err(MapError::AlreadyMapped(cur));
        }

        let pa = match leaf_pa {
            Some(pa) => pa,
            None => frames
                .alloc_frames(level.leaf_frame_order())
                .ok_or(MapError::OutOfMemory)?
                .base(),
        };

        let entry = flags
            .with_present(true)
            .with_large_page(level.supports_large_leaf())
            .with_physical_address(pa);
        table_mut(self.mapper, table).set(idx, entry);
        Ok(true)
    }

    /// Get or create the next-level table behind `table[idx]`.
    fn ensure_child<F: FrameSource>(
        &self,
        frames: &F,
        table: PhysicalPage<Size4K>,
        idx: usize,
        cur: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let entry = table_mut(self.mapper, table).get(idx);
        if entry.present() {
            if entry.large_page() {
                return Err(MapError::AlreadyMapped(cur));
            }
            return Ok(entry.physical_address().page());
        }

        let child = alloc_table(self.mapper, frames)?;
        // Intermediate links stay permissive; leaves carry the real
        // permissions (access rights AND across levels).
        let link = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(flags.user_access())
            .with_physical_address(child.base());
        table_mut(self.mapper, table).set(idx, link);
        Ok(child)
    }

    fn unmap_level<F: FrameSource>(
        &self,
        frames: &F,
        level: Level,
        table: PhysicalPage<Size4K>,
        from: VirtualAddress,
        to: VirtualAddress,
    ) {
        let span = level.entry_span();
        let mut cur = from;
        while cur < to {
            let idx = level.index_of(cur);
            let entry_base = cur.as_u64() & !(span - 1);
            let entry_end = VirtualAddress::new((entry_base + span).min(to.as_u64()));
            let whole = cur.as_u64() == entry_base && entry_end.as_u64() - entry_base == span;

            let entry = table_mut(self.mapper, table).get(idx);
            if entry.present() {
                if entry.is_leaf_at(level) {
                    debug_assert!(whole, "partial unmap of a large leaf");
                    if whole {
                        frames.free_frames(
                            entry.physical_address().page(),
                            level.leaf_frame_order(),
                        );
                        table_mut(self.mapper, table).set(idx, PageEntryBits::new());
                    }
                } else if let Some(child_level) = level.child() {
                    let child = entry.physical_address().page();
                    self.unmap_level(frames, child_level, child, cur, entry_end);
                    if whole {
                        // The entry's entire reach was unmapped; the child
                        // table cannot hold live entries anymore.
                        frames.free_frames(child, 0);
                        table_mut(self.mapper, table).set(idx, PageEntryBits::new());
                    }
                }
            }
            cur = entry_end;
        }
    }
}

/// View a physical table frame as a [`PageTable`].
#[inline]
fn table_mut<'a, M: PhysMapper>(mapper: &M, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
    // Safety: table frames are allocated and zeroed by this module (or
    // handed in as valid roots); the mapper contract makes them writable.
    unsafe { mapper.phys_to_mut::<PageTable>(page.base()) }
}

fn alloc_table<M: PhysMapper, F: FrameSource>(
    mapper: &M,
    frames: &F,
) -> Result<PhysicalPage<Size4K>, MapError> {
    let page = frames.alloc_frames(0).ok_or(MapError::OutOfMemory)?;
    table_mut(mapper, page).zero();
    Ok(page)
}

const fn check_range(from: VirtualAddress, to: VirtualAddress) -> Result<(), MapError> {
    if from.as_u64() > to.as_u64()
        || !from.is_aligned::<Size4K>()
        || !to.is_aligned::<Size4K>()
    {
        return Err(MapError::InvalidRange);
    }
    Ok(())
}
