//! # Physical Memory Management
//!
//! A buddy allocator over one or more zones of contiguous physical RAM.
//!
//! Block sizes are powers of two between one frame (4 KiB) and
//! `2^MAX_ORDER` frames. Splitting on allocation and buddy-merging on free
//! bound both operations by `O(MAX_ORDER)`, and natural alignment of every
//! block is what lets the object caches find a slab header by masking a
//! pointer.
//!
//! The [`FrameAllocator`] facade serializes each [`Zone`] behind a
//! [`SpinLock`] and implements [`kernel_vmem::FrameSource`], so page
//! tables, object caches and thread stacks all draw from the same pool.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod zone;

pub use zone::Zone;

use alloc::vec::Vec;
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Pfn, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::FrameSource;
use log::{debug, info};

/// A contiguous region of physical memory, as reported by boot firmware.
/// Partial frames at either end are trimmed.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub size: u64,
}

impl MemoryRegion {
    /// First whole frame of the region.
    #[must_use]
    fn first_pfn(&self) -> Pfn {
        Pfn::new(self.start.as_u64().div_ceil(PAGE_SIZE))
    }

    /// Number of whole frames in the region.
    #[must_use]
    fn whole_frames(&self) -> u64 {
        let end = (self.start.as_u64() + self.size) / PAGE_SIZE;
        end.saturating_sub(self.first_pfn().as_u64())
    }
}

/// The memory map handed over by boot code, as two sets of ranges:
/// *regions* describe all RAM (one buddy zone each, descriptors included),
/// *free* ranges the parts of it not claimed by the kernel image, boot data
/// or firmware. Only the free parts ever reach the allocator's lists.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
    free: Vec<MemoryRegion>,
}

impl MemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Add a RAM region (a zone of managed, initially reserved frames).
    #[must_use]
    pub fn with_region(mut self, start: PhysicalAddress, size: u64) -> Self {
        self.regions.push(MemoryRegion { start, size });
        self
    }

    /// Add a range of free memory inside the regions.
    #[must_use]
    pub fn with_free(mut self, start: PhysicalAddress, size: u64) -> Self {
        self.free.push(MemoryRegion { start, size });
        self
    }

    pub fn push(&mut self, region: MemoryRegion) {
        self.regions.push(region);
    }

    pub fn push_free(&mut self, range: MemoryRegion) {
        self.free.push(range);
    }
}

/// Physical allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("no free block of order {0} in any zone")]
    OutOfMemory(u32),
    #[error("order {0} exceeds the maximum of {MAX_ORDER}")]
    OrderTooLarge(u32),
}

/// Buddy allocator facade over every usable zone.
pub struct FrameAllocator {
    zones: Vec<SpinLock<Zone>>,
}

impl FrameAllocator {
    /// Build zones from the boot memory map: one zone per RAM region, then
    /// hand each free range's intersection with the zone to its lists.
    /// Regions too small to hold a single whole frame are dropped, and free
    /// ranges shrink inward to whole frames.
    #[must_use]
    pub fn from_map(map: &MemoryMap) -> Self {
        let mut zones = Vec::new();
        for region in &map.regions {
            let frames = region.whole_frames();
            if frames == 0 {
                debug!("skipping sub-frame region at {}", region.start);
                continue;
            }
            let start = region.first_pfn();
            let end = start + frames;

            let mut zone = Zone::new(start, frames);
            for range in &map.free {
                let lo = range.first_pfn().max(start);
                let hi = (range.first_pfn() + range.whole_frames()).min(end);
                if lo < hi {
                    zone.mark_free(lo, hi);
                }
            }
            info!(
                "physical zone {}..{}: {} of {frames} frames free",
                start.address(),
                end.address(),
                zone.free_frames()
            );
            zones.push(SpinLock::new(zone));
        }
        Self { zones }
    }

    /// Allocate a naturally aligned block of `2^order` frames, trying
    /// zones in order.
    ///
    /// # Errors
    /// [`AllocError::OrderTooLarge`] above `MAX_ORDER`;
    /// [`AllocError::OutOfMemory`] when no zone can satisfy the order.
    pub fn allocate(&self, order: u32) -> Result<PhysicalPage<Size4K>, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge(order));
        }
        for zone in &self.zones {
            if let Some(pfn) = zone.lock().alloc(order) {
                return Ok(PhysicalPage::from_pfn(pfn));
            }
        }
        Err(AllocError::OutOfMemory(order))
    }

    /// Return a block to its owning zone.
    ///
    /// A block that belongs to no zone is rejected with a log entry rather
    /// than corrupting the lists.
    pub fn free(&self, block: PhysicalPage<Size4K>) {
        let pfn = block.pfn();
        for zone in &self.zones {
            let mut zone = zone.lock();
            if zone.contains(pfn) {
                zone.free(pfn);
                return;
            }
        }
        log::warn!("free of {pfn:?} outside every zone; ignored");
    }

    /// Whether `pa` falls inside any managed zone.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        let pfn = pa.pfn();
        self.zones.iter().any(|z| z.lock().contains(pfn))
    }

    /// Free frames across all zones.
    #[must_use]
    pub fn available_frames(&self) -> u64 {
        self.zones.iter().map(|z| z.lock().free_frames()).sum()
    }
}

impl FrameSource for FrameAllocator {
    fn alloc_frames(&self, order: u32) -> Option<PhysicalPage<Size4K>> {
        self.allocate(order).ok()
    }

    fn free_frames(&self, block: PhysicalPage<Size4K>, order: u32) {
        #[cfg(debug_assertions)]
        {
            let pfn = block.pfn();
            for zone in &self.zones {
                let zone = zone.lock();
                if zone.contains(pfn) {
                    debug_assert_eq!(zone.block_order(pfn), order, "order mismatch on free");
                }
            }
        }
        let _ = order;
        self.free(block);
    }
}
