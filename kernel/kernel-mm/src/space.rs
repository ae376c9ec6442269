//! The address-space manager: one page-table tree plus its region list.

use alloc::vec::Vec;
use core::ptr;
use core::slice;
use kernel_info::memory::{PAGE_SIZE, USER_TOP};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_slab::{ObjRef, ObjectCache};
use kernel_vmem::{AddressSpace, FrameSource, PageEntryBits, PhysMapper, RootPage};
use log::{debug, warn};

use crate::{AccessError, MmapError, MunmapError, Vma, VmaFlags};

/// First address above the user half.
const fn user_top() -> VirtualAddress {
    VirtualAddress::new(USER_TOP)
}

/// Page-table bits for a user region.
fn entry_flags(flags: VmaFlags) -> PageEntryBits {
    PageEntryBits::new()
        .with_user_access(true)
        .with_writable(flags.contains(VmaFlags::WRITE))
        .with_no_execute(!flags.contains(VmaFlags::EXECUTE))
}

/// One process address space: the page-table tree and the sorted,
/// non-overlapping list of regions mapped into its user half.
///
/// VMA records come from a shared slab cache; the space owns the handles
/// and keeps them ordered by `begin`.
pub struct MemorySpace<'m, M: PhysMapper> {
    mapper: &'m M,
    space: AddressSpace<'m, M>,
    records: &'m ObjectCache<'m, M, Vma>,
    vmas: Vec<ObjRef<Vma>>,
}

impl<'m, M: PhysMapper> MemorySpace<'m, M> {
    /// Create an empty space. With a `kernel_template`, the kernel-half L4
    /// entries are copied over so every process shares the same upper-half
    /// subtrees; the user half starts unmapped either way.
    ///
    /// # Errors
    /// [`MmapError::OutOfMemory`] when no frame is available for the root.
    pub fn create(
        mapper: &'m M,
        frames: &impl FrameSource,
        records: &'m ObjectCache<'m, M, Vma>,
        kernel_template: Option<RootPage>,
    ) -> Result<Self, MmapError> {
        let space = AddressSpace::create(mapper, frames)?;
        if let Some(template) = kernel_template {
            space.adopt_kernel_half(template);
        }
        Ok(Self {
            mapper,
            space,
            records,
            vmas: Vec::new(),
        })
    }

    /// The L4 root page, e.g. for loading into CR3 or seeding another
    /// space's kernel half.
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.space.root_page()
    }

    /// Snapshot of the region list, in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<Vma> {
        self.vmas.iter().map(|r| self.records.read(r)).collect()
    }

    /// Translate a user address through the page tables.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }

    /// Map `[from, to)` as one new region with fresh physical backing.
    ///
    /// An empty range is a no-op success. On any failure the space is
    /// unchanged: if the page-table build fails midway, the partially
    /// built range is torn down again over boundaries widened to the
    /// neighboring regions (or the space edges), so every intermediate
    /// table the attempt created is reclaimed.
    ///
    /// # Errors
    /// [`MmapError::OutOfBounds`], [`MmapError::Unaligned`],
    /// [`MmapError::Overlap`] or [`MmapError::OutOfMemory`].
    pub fn mmap(
        &mut self,
        frames: &impl FrameSource,
        from: VirtualAddress,
        to: VirtualAddress,
        flags: VmaFlags,
    ) -> Result<(), MmapError> {
        if to > user_top() {
            return Err(MmapError::OutOfBounds);
        }
        if from == to {
            return Ok(());
        }
        if from > to || !from.is_aligned::<Size4K>() || !to.is_aligned::<Size4K>() {
            return Err(MmapError::Unaligned);
        }

        // Insertion point: first region at or above `to`. Anything earlier
        // that ends after `from` overlaps.
        let mut insert_at = self.vmas.len();
        for (i, record) in self.vmas.iter().enumerate() {
            let vma = self.records.read(record);
            if vma.begin >= to {
                insert_at = i;
                break;
            }
            if vma.end > from {
                debug!("mmap [{from}, {to}) overlaps [{}, {})", vma.begin, vma.end);
                return Err(MmapError::Overlap);
            }
        }

        let record = self
            .records
            .allocate(frames, Vma { begin: from, end: to, flags })
            .map_err(|_| MmapError::OutOfMemory)?;

        if let Err(err) = self.space.map_range(frames, from, to, entry_flags(flags)) {
            // Tear the partial build down over the widened range so the
            // attempt leaves no half-filled intermediate tables behind.
            let (begin, end) = self.widened(insert_at, insert_at);
            self.space.unmap_range(frames, begin, end);
            self.records.free(record);
            return Err(err.into());
        }

        self.vmas.insert(insert_at, record);
        Ok(())
    }

    /// Unmap `[from, to)`. The range must exactly equal the union of whole
    /// existing regions; covering zero regions is a no-op success.
    ///
    /// The page-table teardown runs over boundaries widened to the nearest
    /// remaining neighbors (or the space edges), which is what makes the
    /// vacated intermediate tables reclaimable.
    ///
    /// # Errors
    /// [`MunmapError::Unaligned`] or [`MunmapError::PartialCoverage`]; the
    /// space is unchanged on error.
    pub fn munmap(
        &mut self,
        frames: &impl FrameSource,
        from: VirtualAddress,
        to: VirtualAddress,
    ) -> Result<(), MunmapError> {
        if from > to || !from.is_aligned::<Size4K>() || !to.is_aligned::<Size4K>() {
            return Err(MunmapError::Unaligned);
        }

        // Locate the window of covered regions, rejecting any straddler.
        let mut first = None;
        let mut after = self.vmas.len();
        for (i, record) in self.vmas.iter().enumerate() {
            let vma = self.records.read(record);
            if vma.end <= from {
                continue;
            }
            if vma.begin >= to {
                after = i;
                break;
            }
            if vma.begin < from || vma.end > to {
                return Err(MunmapError::PartialCoverage);
            }
            if first.is_none() {
                first = Some(i);
            }
        }
        let first = first.unwrap_or(after);

        for record in self.vmas.drain(first..after) {
            self.records.free(record);
        }

        let (begin, end) = self.widened(first, first);
        self.space.unmap_range(frames, begin, end);
        Ok(())
    }

    /// Fill `len` bytes at `to` with `value`, page by page through
    /// translation.
    ///
    /// # Errors
    /// [`AccessError::NotMapped`] at the first hole; bytes before it are
    /// already written.
    pub fn mset(&self, to: VirtualAddress, value: u8, len: u64) -> Result<(), AccessError> {
        let mut va = to;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = (PAGE_SIZE - va.offset::<Size4K>()).min(remaining);
            let pa = self.space.translate(va).ok_or(AccessError::NotMapped(va))?;
            // Safety: translation proved `[pa, pa + chunk)` lies inside one
            // mapped frame; the mapper hands out the backing bytes.
            unsafe {
                let first: *mut u8 = ptr::from_mut(self.mapper.phys_to_mut::<u8>(pa));
                slice::from_raw_parts_mut(first, chunk as usize).fill(value);
            }
            va = va + chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Copy `len` bytes from `from` in `src` to `to` in this space, in
    /// chunks bounded by both sides' page remainders.
    ///
    /// # Errors
    /// [`AccessError::NotMapped`] at the first hole on either side; bytes
    /// before it are already copied.
    pub fn mcopy(
        &self,
        to: VirtualAddress,
        src: &Self,
        from: VirtualAddress,
        len: u64,
    ) -> Result<(), AccessError> {
        let mut dst_va = to;
        let mut src_va = from;
        let mut remaining = len;
        while remaining > 0 {
            let dst_room = PAGE_SIZE - dst_va.offset::<Size4K>();
            let src_room = PAGE_SIZE - src_va.offset::<Size4K>();
            let chunk = dst_room.min(src_room).min(remaining);

            let src_pa = src
                .space
                .translate(src_va)
                .ok_or(AccessError::NotMapped(src_va))?;
            let dst_pa = self
                .space
                .translate(dst_va)
                .ok_or(AccessError::NotMapped(dst_va))?;

            // Safety: both chunks were just translated and stay inside one
            // frame each. `ptr::copy` tolerates the two spaces aliasing
            // the same physical frame.
            unsafe {
                let s: *const u8 = ptr::from_mut(src.mapper.phys_to_mut::<u8>(src_pa));
                let d: *mut u8 = ptr::from_mut(self.mapper.phys_to_mut::<u8>(dst_pa));
                ptr::copy(s, d, chunk as usize);
            }

            dst_va = dst_va + chunk;
            src_va = src_va + chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Reproduce every region of this space, flags and contents included,
    /// inside `dst`. On failure `dst`'s whole user half is unmapped again.
    ///
    /// # Errors
    /// Any [`MmapError`] from installing a region into `dst`.
    pub fn duplicate_into(
        &self,
        frames: &impl FrameSource,
        dst: &mut Self,
    ) -> Result<(), MmapError> {
        for record in &self.vmas {
            let vma = self.records.read(record);
            if let Err(err) = dst.mmap(frames, vma.begin, vma.end, vma.flags) {
                // Roll the whole user half back; full-range munmap of
                // regions we just created cannot fail.
                let _ = dst.munmap(frames, VirtualAddress::zero(), user_top());
                return Err(err);
            }
            if let Err(err) = dst.mcopy(vma.begin, self, vma.begin, vma.len()) {
                warn!("copy into fresh mapping failed: {err}");
            }
        }
        Ok(())
    }

    /// Tear the whole space down: every region, then the root table.
    pub fn release(mut self, frames: &impl FrameSource) {
        // Full-range munmap cannot fail and leaves the user half empty.
        let _ = self.munmap(frames, VirtualAddress::zero(), user_top());
        let Self { space, vmas, .. } = self;
        debug_assert!(vmas.is_empty());
        space.release_root(frames);
    }

    /// Teardown boundaries for the gap at `[lo, hi)` in the region list:
    /// widened down to the previous region's end (or 0) and up to the next
    /// region's begin (or the user boundary).
    fn widened(&self, lo: usize, hi: usize) -> (VirtualAddress, VirtualAddress) {
        let begin = if lo == 0 {
            VirtualAddress::zero()
        } else {
            self.records.read(&self.vmas[lo - 1]).end
        };
        let end = if hi == self.vmas.len() {
            user_top()
        } else {
            self.records.read(&self.vmas[hi]).begin
        };
        (begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_flags_map_to_entry_bits() {
        let e = entry_flags(VmaFlags::READ | VmaFlags::WRITE);
        assert!(e.user_access());
        assert!(e.writable());
        assert!(e.no_execute());

        let e = entry_flags(VmaFlags::READ | VmaFlags::EXECUTE);
        assert!(!e.writable());
        assert!(!e.no_execute());
    }
}
