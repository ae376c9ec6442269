//! A single contiguous physical zone managed by the buddy scheme.
//!
//! Every frame in the zone has a [`PageDescriptor`] in a flat arena; free
//! blocks are linked into per-order lists through `u32` arena indices, with
//! [`NIL`] as the terminator. Only the *first* frame of a block carries
//! meaningful state: its order, and whether the block sits on a free list.
//!
//! All arithmetic runs on **absolute** frame numbers. The buddy of an
//! order-`o` block flips exactly bit `o` of the frame number, which works
//! precisely because blocks are naturally aligned in absolute terms — a
//! property the greedy seeding below maintains for zones of arbitrary,
//! non-power-of-two size.

use alloc::vec::Vec;
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::Pfn;

/// Free-list terminator.
const NIL: u32 = u32::MAX;

/// Number of per-order free lists (orders `0..=MAX_ORDER`).
const ORDERS: usize = MAX_ORDER as usize + 1;

/// Per-frame bookkeeping. Only block heads have interesting contents.
#[derive(Copy, Clone)]
struct PageDescriptor {
    /// Order of the block this frame heads (valid on heads only).
    order: u8,
    /// Whether the block headed here sits on a free list.
    free: bool,
    /// Free-list neighbors, as descriptor-arena indices.
    prev: u32,
    next: u32,
}

impl PageDescriptor {
    const fn unlinked() -> Self {
        Self {
            order: 0,
            free: false,
            prev: NIL,
            next: NIL,
        }
    }
}

/// One contiguous run of physical frames under buddy management.
pub struct Zone {
    /// First frame of the zone (absolute).
    start: Pfn,
    /// Number of frames.
    frames: u64,
    descriptors: Vec<PageDescriptor>,
    /// Head index per order, [`NIL`] when empty.
    heads: [u32; ORDERS],
    /// Free frames (not blocks) currently in the lists.
    free_frames: u64,
}

impl Zone {
    /// Create a zone spanning `[start, start + frames)` with every frame
    /// initially *reserved*: the free lists start empty.
    ///
    /// Boot code then hands over the usable sub-ranges with
    /// [`mark_free`](Self::mark_free); whatever it never marks (kernel
    /// image, boot data) stays out of the allocator's reach forever.
    #[must_use]
    pub fn new(start: Pfn, frames: u64) -> Self {
        debug_assert!(frames > 0);
        debug_assert!(u32::try_from(frames).is_ok(), "zone exceeds u32 arena");

        Self {
            start,
            frames,
            descriptors: alloc::vec![PageDescriptor::unlinked(); frames as usize],
            heads: [NIL; ORDERS],
            free_frames: 0,
        }
    }

    /// Hand the frames of `[from, to)` to the free lists.
    ///
    /// The walk is greedy: starting at `from`, the largest block that is
    /// naturally aligned *and* fits before `to` is carved off and enqueued,
    /// then the cursor advances past it. A range of arbitrary size thus
    /// decomposes into maximal aligned blocks, and natural alignment in
    /// absolute frame numbers is what keeps the buddy arithmetic honest.
    ///
    /// The range must lie inside the zone and must not contain frames that
    /// are already free.
    pub fn mark_free(&mut self, from: Pfn, to: Pfn) {
        debug_assert!(from >= self.start && to <= self.end());
        let mut cur = from;
        while cur < to {
            debug_assert!(
                !self.descriptors[self.index_of(cur)].free,
                "{cur:?} marked free twice"
            );
            let order = cur.max_block_order(to, MAX_ORDER);
            self.push_free(cur, order);
            cur = cur + (1u64 << order);
        }
    }

    /// First frame of the zone.
    #[must_use]
    pub const fn start(&self) -> Pfn {
        self.start
    }

    /// One-past-the-last frame of the zone.
    #[must_use]
    pub fn end(&self) -> Pfn {
        self.start + self.frames
    }

    /// Whether `pfn` lies inside this zone.
    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start && pfn < self.end()
    }

    /// Free frames currently available.
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free_frames
    }

    /// Number of free blocks at `order` (walks the list; diagnostics).
    #[must_use]
    pub fn free_blocks(&self, order: u32) -> usize {
        let mut n = 0;
        let mut idx = self.heads[order as usize];
        while idx != NIL {
            n += 1;
            idx = self.descriptors[idx as usize].next;
        }
        n
    }

    /// Walk every free block as `(head, order)` pairs.
    pub fn for_each_free_block(&self, mut f: impl FnMut(Pfn, u32)) {
        for order in 0..ORDERS {
            let mut idx = self.heads[order];
            while idx != NIL {
                f(self.start + u64::from(idx), order as u32);
                idx = self.descriptors[idx as usize].next;
            }
        }
    }

    /// Allocate a naturally aligned block of `2^order` frames.
    ///
    /// Takes the smallest available block of at least the requested order
    /// and splits it down, pushing the upper half back on the free list at
    /// each step, so at most `MAX_ORDER` iterations.
    pub fn alloc(&mut self, order: u32) -> Option<Pfn> {
        if order > MAX_ORDER {
            return None;
        }

        let mut have = order;
        while have <= MAX_ORDER && self.heads[have as usize] == NIL {
            have += 1;
        }
        if have > MAX_ORDER {
            return None;
        }

        let pfn = self.pop_free(have)?;
        // Split down: the lower half keeps shrinking, the upper halves go
        // back on the lists.
        while have > order {
            have -= 1;
            self.push_free(pfn + (1u64 << have), have);
        }

        // The counter is already settled: pop_free debited the whole block
        // and each push above credited its upper half back.
        let idx = self.index_of(pfn);
        self.descriptors[idx].order = order as u8;
        Some(pfn)
    }

    /// Return the block headed at `pfn` to the free lists, coalescing with
    /// its buddy at each order as long as the buddy is a free block of the
    /// same order inside the zone. The merged block keeps the
    /// lower-addressed frame as its head.
    pub fn free(&mut self, pfn: Pfn) {
        let idx = self.index_of(pfn);
        debug_assert!(!self.descriptors[idx].free, "double free of {pfn:?}");
        let mut order = u32::from(self.descriptors[idx].order);
        let mut head = pfn;

        while order < MAX_ORDER {
            let buddy = head.buddy(order);
            if !self.is_free_block(buddy, order) {
                break;
            }
            self.remove_free(buddy, order);
            if buddy < head {
                head = buddy;
            }
            order += 1;
        }

        self.push_free(head, order);
    }

    /// Order recorded for the allocated block headed at `pfn`.
    #[must_use]
    pub fn block_order(&self, pfn: Pfn) -> u32 {
        u32::from(self.descriptors[self.index_of(pfn)].order)
    }

    fn index_of(&self, pfn: Pfn) -> usize {
        debug_assert!(self.contains(pfn));
        (pfn.as_u64() - self.start.as_u64()) as usize
    }

    /// Whether `pfn` heads a free block of exactly `order` lying fully
    /// inside the zone.
    fn is_free_block(&self, pfn: Pfn, order: u32) -> bool {
        if pfn < self.start || pfn + (1u64 << order) > self.end() {
            return false;
        }
        let d = &self.descriptors[self.index_of(pfn)];
        d.free && u32::from(d.order) == order
    }

    fn push_free(&mut self, pfn: Pfn, order: u32) {
        let idx = self.index_of(pfn) as u32;
        let head = self.heads[order as usize];

        let d = &mut self.descriptors[idx as usize];
        d.order = order as u8;
        d.free = true;
        d.prev = NIL;
        d.next = head;

        if head != NIL {
            self.descriptors[head as usize].prev = idx;
        }
        self.heads[order as usize] = idx;
        self.free_frames += 1u64 << order;
    }

    fn pop_free(&mut self, order: u32) -> Option<Pfn> {
        let idx = self.heads[order as usize];
        if idx == NIL {
            return None;
        }
        let pfn = self.start + u64::from(idx);
        self.remove_free(pfn, order);
        // remove_free debits the counter and clears `free`; the caller
        // decides the block's fate.
        Some(pfn)
    }

    fn remove_free(&mut self, pfn: Pfn, order: u32) {
        let idx = self.index_of(pfn);
        let (prev, next) = {
            let d = &self.descriptors[idx];
            debug_assert!(d.free && u32::from(d.order) == order);
            (d.prev, d.next)
        };

        if prev == NIL {
            self.heads[order as usize] = next;
        } else {
            self.descriptors[prev as usize].next = next;
        }
        if next != NIL {
            self.descriptors[next as usize].prev = prev;
        }

        let d = &mut self.descriptors[idx];
        d.free = false;
        d.prev = NIL;
        d.next = NIL;
        self.free_frames -= 1u64 << order;
    }
}
