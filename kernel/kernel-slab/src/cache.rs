//! The raw slab cache: untyped fixed-size slots over buddy blocks.
//!
//! Every slab is naturally aligned to its own size in physical space, a
//! guarantee the buddy allocator provides for free. Freeing therefore finds
//! the owning slab by masking the slot address down to that alignment; the
//! masked base is validated against the cache's slab lists and the slot
//! offset against the object stride before anything is dereferenced.

use alloc::vec::Vec;
use core::mem::{size_of, take};
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameSource, PhysMapper};
use log::{debug, trace};

use crate::CacheError;

/// Bookkeeping in the trailing bytes of each slab block.
#[repr(C)]
struct SlabHeader {
    /// Physical address of the first free slot, [`LINK_NIL`] when none
    /// remain.
    free_head: u64,
    /// Slots currently on the embedded free list.
    free_count: u32,
}

/// Embedded free-list terminator. Not an address: physical address zero is
/// a perfectly valid slot in a slab based at frame 0.
const LINK_NIL: u64 = u64::MAX;

/// Free slots must hold a link to the next one.
const MIN_OBJECT_ALIGN: u64 = size_of::<u64>() as u64;

/// Derived layout of one cache: object stride, slab order and how many
/// objects one slab holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Geometry {
    object_size: u64,
    slab_order: u32,
    capacity: u32,
}

/// Round the object up to the free-list link and the requested alignment,
/// then pick the smallest slab order whose block amortizes the buddy
/// allocator's `O(MAX_ORDER)` cost over at least `MAX_ORDER` objects.
fn select_geometry(size: usize, align: usize) -> Result<Geometry, CacheError> {
    let align = (align as u64).max(MIN_OBJECT_ALIGN);
    debug_assert!(align.is_power_of_two());
    let object_size = (size as u64).max(1).next_multiple_of(align);

    let header = size_of::<SlabHeader>() as u64;
    for slab_order in 0..=MAX_ORDER {
        let usable = (PAGE_SIZE << slab_order) - header;
        let capacity = usable / object_size;
        if capacity >= u64::from(MAX_ORDER) {
            return Ok(Geometry {
                object_size,
                slab_order,
                capacity: capacity as u32,
            });
        }
    }
    Err(CacheError::ObjectTooLarge(size))
}

/// Which slabs exist and how full they are. A slab base lives on exactly
/// one of the three lists at any time.
#[derive(Default)]
struct Lists {
    empty: Vec<PhysicalAddress>,
    partial: Vec<PhysicalAddress>,
    full: Vec<PhysicalAddress>,
}

/// A cache of fixed-size objects carved out of buddy blocks.
///
/// All mutation is serialized by the cache's own lock; the nested buddy
/// calls in [`SlabCache::allocate`] and [`SlabCache::shrink`] are safe
/// because the frame allocator locks independently.
pub struct SlabCache<'m, M: PhysMapper> {
    mapper: &'m M,
    geometry: Geometry,
    lists: SpinLock<Lists>,
}

impl<'m, M: PhysMapper> SlabCache<'m, M> {
    /// Set up a cache for objects of `size` bytes at `align` alignment.
    ///
    /// # Errors
    /// [`CacheError::ObjectTooLarge`] when no slab order can amortize the
    /// object.
    pub fn new(mapper: &'m M, size: usize, align: usize) -> Result<Self, CacheError> {
        let geometry = select_geometry(size, align)?;
        debug!(
            "slab cache: {} B objects, order-{} slabs of {} objects",
            geometry.object_size, geometry.slab_order, geometry.capacity
        );
        Ok(Self {
            mapper,
            geometry,
            lists: SpinLock::new(Lists::default()),
        })
    }

    /// Object stride in bytes (requested size after rounding).
    #[must_use]
    pub const fn object_size(&self) -> u64 {
        self.geometry.object_size
    }

    /// Buddy order of each slab block.
    #[must_use]
    pub const fn slab_order(&self) -> u32 {
        self.geometry.slab_order
    }

    /// Objects held by one slab.
    #[must_use]
    pub const fn slab_capacity(&self) -> u32 {
        self.geometry.capacity
    }

    pub(crate) const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Allocate one object slot.
    ///
    /// Prefers a partially used slab, then an empty one, and only then
    /// grows the cache by one buddy block.
    ///
    /// # Errors
    /// [`CacheError::OutOfMemory`] when a new slab is needed and `frames`
    /// cannot supply it.
    pub fn allocate(&self, frames: &impl FrameSource) -> Result<PhysicalAddress, CacheError> {
        let mut lists = self.lists.lock();

        let base = if let Some(base) = lists.partial.pop() {
            base
        } else if let Some(base) = lists.empty.pop() {
            base
        } else {
            self.grow(frames)?
        };

        let header = self.header(base);
        debug_assert!(header.free_head != LINK_NIL, "listed slab has no free slot");
        let slot = PhysicalAddress::new(header.free_head);
        header.free_head = self.read_link(slot);
        header.free_count -= 1;

        if header.free_count == 0 {
            lists.full.push(base);
        } else {
            lists.partial.push(base);
        }
        Ok(slot)
    }

    /// Return the slot at `object` to its owning slab.
    ///
    /// The owning slab is found by masking the address down to the slab
    /// block's natural alignment. The masked base must be one of this
    /// cache's slabs and the offset must sit exactly on an object stride;
    /// otherwise nothing is touched.
    ///
    /// # Errors
    /// [`CacheError::ForeignPointer`] when validation fails.
    pub fn free(&self, object: PhysicalAddress) -> Result<(), CacheError> {
        let block = self.block_bytes();
        let base = PhysicalAddress::new(object.as_u64() & !(block - 1));

        let mut lists = self.lists.lock();

        // An object can only come from a slab with live objects, so empty
        // slabs are not searched.
        let place = lists
            .partial
            .iter()
            .position(|&b| b == base)
            .map(|i| (true, i))
            .or_else(|| lists.full.iter().position(|&b| b == base).map(|i| (false, i)));
        let Some((was_partial, index)) = place else {
            return Err(CacheError::ForeignPointer(object));
        };

        let offset = object.as_u64() - base.as_u64();
        let in_bounds = offset / self.geometry.object_size < u64::from(self.geometry.capacity);
        if offset % self.geometry.object_size != 0 || !in_bounds {
            return Err(CacheError::ForeignPointer(object));
        }

        if was_partial {
            lists.partial.swap_remove(index);
        } else {
            lists.full.swap_remove(index);
        }

        let header = self.header(base);
        self.write_link(object, header.free_head);
        header.free_head = object.as_u64();
        header.free_count += 1;

        if header.free_count == self.geometry.capacity {
            lists.empty.push(base);
        } else {
            lists.partial.push(base);
        }
        Ok(())
    }

    /// Release every empty slab back to the buddy allocator. Returns the
    /// number of slabs released.
    pub fn shrink(&self, frames: &impl FrameSource) -> usize {
        let drained = take(&mut self.lists.lock().empty);
        let released = drained.len();
        for base in drained {
            frames.free_frames(base.page::<Size4K>(), self.geometry.slab_order);
        }
        if released > 0 {
            trace!("released {released} empty slabs");
        }
        released
    }

    /// Tear the cache down, returning all slabs to the buddy allocator.
    ///
    /// # Errors
    /// [`CacheError::ObjectsLive`] while any object is still allocated.
    pub fn release(self, frames: &impl FrameSource) -> Result<(), CacheError> {
        let live = self.live_objects();
        if live != 0 {
            return Err(CacheError::ObjectsLive(live));
        }
        self.shrink(frames);
        Ok(())
    }

    /// Objects currently allocated across all slabs.
    #[must_use]
    pub fn live_objects(&self) -> u64 {
        let lists = self.lists.lock();
        let capacity = u64::from(self.geometry.capacity);
        let in_partial: u64 = lists
            .partial
            .iter()
            .map(|&b| capacity - u64::from(self.header(b).free_count))
            .sum();
        lists.full.len() as u64 * capacity + in_partial
    }

    /// Free slots currently available without growing.
    #[must_use]
    pub fn free_objects(&self) -> u64 {
        let lists = self.lists.lock();
        let capacity = u64::from(self.geometry.capacity);
        let in_partial: u64 = lists
            .partial
            .iter()
            .map(|&b| u64::from(self.header(b).free_count))
            .sum();
        lists.empty.len() as u64 * capacity + in_partial
    }

    /// Slabs currently owned by the cache.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.empty.len() + lists.partial.len() + lists.full.len()
    }

    const fn block_bytes(&self) -> u64 {
        PAGE_SIZE << self.geometry.slab_order
    }

    /// Allocate one buddy block and thread every slot onto its free list.
    /// The new slab is handed back unlisted; the caller files it.
    fn grow(&self, frames: &impl FrameSource) -> Result<PhysicalAddress, CacheError> {
        let order = self.geometry.slab_order;
        let block = frames
            .alloc_frames(order)
            .ok_or(CacheError::OutOfMemory(order))?;
        let base = block.base();
        debug_assert!(base.as_u64() % self.block_bytes() == 0, "slab not naturally aligned");

        let stride = self.geometry.object_size;
        for i in 0..u64::from(self.geometry.capacity) {
            let slot = base + i * stride;
            let next = if i + 1 == u64::from(self.geometry.capacity) {
                LINK_NIL
            } else {
                (slot + stride).as_u64()
            };
            self.write_link(slot, next);
        }

        let header = self.header(base);
        header.free_head = base.as_u64();
        header.free_count = self.geometry.capacity;
        trace!("new slab at {base}");
        Ok(base)
    }

    fn header<'a>(&self, base: PhysicalAddress) -> &'a mut SlabHeader {
        let pa = base + (self.block_bytes() - size_of::<SlabHeader>() as u64);
        // Safety: the header occupies the trailing bytes of a block this
        // cache owns; the cache lock serializes all access to it.
        unsafe { self.mapper.phys_to_mut(pa) }
    }

    fn read_link(&self, slot: PhysicalAddress) -> u64 {
        // Safety: `slot` is a free slot of a slab this cache owns; free
        // slots hold nothing but the link.
        unsafe { *self.mapper.phys_to_mut::<u64>(slot) }
    }

    fn write_link(&self, slot: PhysicalAddress, next: u64) {
        // Safety: as for `read_link`; the slot is free, so no object
        // bytes are overwritten.
        unsafe {
            *self.mapper.phys_to_mut::<u64>(slot) = next;
        }
    }
}
