//! # Object Caches
//!
//! Slab caches for fixed-size kernel objects, backed by the buddy
//! allocator.
//!
//! A *slab* is one buddy block of `2^slab_order` frames holding as many
//! same-size objects as fit, plus a small header in the block's trailing
//! bytes. Free slots are threaded into a free list embedded in the slots
//! themselves, so a slab needs no allocation of its own. The slab order is
//! chosen large enough that one buddy call is amortized over at least
//! `MAX_ORDER` object allocations, keeping per-object cost O(1).
//!
//! [`SlabCache`] deals in raw [`PhysicalAddress`] slots; [`ObjectCache`]
//! wraps it with a typed handle per object. Physical memory is reached
//! through the same [`kernel_vmem::PhysMapper`] seam the page-table code
//! uses, so the caches are host-testable over simulated RAM.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cache;
mod object;

pub use cache::SlabCache;
pub use object::{ObjRef, ObjectCache};

use kernel_memory_addresses::PhysicalAddress;

/// Object-cache failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// No slab order up to `MAX_ORDER` can hold even `MAX_ORDER` objects of
    /// this size. A start-up misconfiguration, not a steady-state failure.
    #[error("object size {0} does not fit any slab order")]
    ObjectTooLarge(usize),
    /// The buddy allocator could not supply a new slab block.
    #[error("no physical block of order {0} available for a new slab")]
    OutOfMemory(u32),
    /// The address does not name a live object slot of this cache.
    #[error("{0} is not an object of this cache")]
    ForeignPointer(PhysicalAddress),
    /// Release was attempted while objects are still allocated.
    #[error("cache still holds {0} live objects")]
    ObjectsLive(u64),
}
