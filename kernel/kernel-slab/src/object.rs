//! Typed objects on top of the raw slab cache.
//!
//! [`ObjectCache`] fixes the slot layout to one `T` and hands out
//! [`ObjRef`] handles instead of raw physical addresses. A handle cannot
//! be forged or duplicated, so as long as callers free handles into the
//! cache that produced them, the raw pointer validation never fires.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{FrameSource, PhysMapper};
use log::warn;

use crate::{CacheError, SlabCache};

/// Owning handle to one `T` inside a slab. Freed by giving it back to the
/// cache; dropping it without doing so leaks the slot.
pub struct ObjRef<T> {
    pa: PhysicalAddress,
    _marker: PhantomData<T>,
}

impl<T> ObjRef<T> {
    /// Physical address of the object slot.
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.pa
    }
}

impl<T> fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:?})", self.pa)
    }
}

/// A slab cache serving objects of a single `Copy` type.
///
/// Objects live in physical memory reached through the mapper, never in
/// host/kernel heap, so values move in and out by copy.
pub struct ObjectCache<'m, M: PhysMapper, T: Copy> {
    raw: SlabCache<'m, M>,
    _marker: PhantomData<T>,
}

impl<'m, M: PhysMapper, T: Copy> ObjectCache<'m, M, T> {
    /// Set up a cache sized and aligned for `T`.
    ///
    /// # Errors
    /// [`CacheError::ObjectTooLarge`] when `T` fits no slab order.
    pub fn new(mapper: &'m M) -> Result<Self, CacheError> {
        Ok(Self {
            raw: SlabCache::new(mapper, size_of::<T>(), align_of::<T>())?,
            _marker: PhantomData,
        })
    }

    /// Allocate a slot and move `value` into it.
    ///
    /// # Errors
    /// [`CacheError::OutOfMemory`] when a new slab is needed and `frames`
    /// cannot supply it.
    pub fn allocate(
        &self,
        frames: &impl FrameSource,
        value: T,
    ) -> Result<ObjRef<T>, CacheError> {
        let pa = self.raw.allocate(frames)?;
        // Safety: the slot was just handed out by the cache and is at
        // least as large and aligned as `T`; `T: Copy` means no drop runs
        // on the stale bytes.
        unsafe {
            *self.raw.mapper().phys_to_mut::<T>(pa) = value;
        }
        Ok(ObjRef {
            pa,
            _marker: PhantomData,
        })
    }

    /// Copy the object out.
    #[must_use]
    pub fn read(&self, object: &ObjRef<T>) -> T {
        // Safety: the handle proves the slot holds an initialized `T`.
        unsafe { *self.raw.mapper().phys_to_mut::<T>(object.pa) }
    }

    /// Overwrite the object.
    pub fn write(&self, object: &ObjRef<T>, value: T) {
        // Safety: as for `read`.
        unsafe {
            *self.raw.mapper().phys_to_mut::<T>(object.pa) = value;
        }
    }

    /// Give the slot back. Handles are unforgeable, so rejection can only
    /// mean the handle was fed to a different cache; the slot is then
    /// leaked rather than corrupting this cache's lists.
    pub fn free(&self, object: ObjRef<T>) {
        if let Err(err) = self.raw.free(object.pa) {
            warn!("typed free rejected: {err}");
        }
    }

    /// Release every empty slab back to the buddy allocator.
    pub fn shrink(&self, frames: &impl FrameSource) -> usize {
        self.raw.shrink(frames)
    }

    /// Tear the cache down.
    ///
    /// # Errors
    /// [`CacheError::ObjectsLive`] while any object is still allocated.
    pub fn release(self, frames: &impl FrameSource) -> Result<(), CacheError> {
        self.raw.release(frames)
    }

    /// Objects currently allocated.
    #[must_use]
    pub fn live_objects(&self) -> u64 {
        self.raw.live_objects()
    }

    /// The untyped cache underneath.
    #[must_use]
    pub const fn raw(&self) -> &SlabCache<'m, M> {
        &self.raw
    }
}
