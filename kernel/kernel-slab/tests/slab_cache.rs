use kernel_memory_addresses::PhysicalAddress;
use kernel_pmm::{FrameAllocator, MemoryMap};
use kernel_slab::{CacheError, ObjectCache, SlabCache};
use kernel_vmem::PhysMapper;

/// A 4 KiB-aligned raw frame; the "physical RAM" backing store.
#[repr(align(4096))]
struct Aligned4K([u8; 4096]);

/// Simulated physical memory with physical addresses counted from 0.
/// Unlike page tables, slab objects sit at arbitrary in-frame offsets, so
/// the mapper addresses the backing store as one byte range.
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
        let off = pa.as_u64() as usize;
        debug_assert!(off + size_of::<T>() <= self.frames.len() * 4096);
        debug_assert_eq!(off % align_of::<T>(), 0);
        let base = self.frames.as_ptr().cast::<u8>().cast_mut();
        // SAFETY: the offset stays inside the backing vector and the
        // caller promises `T` matches the bytes there.
        unsafe { &mut *base.add(off).cast::<T>() }
    }
}

/// Real buddy allocator over the simulated RAM, zone starting at PA 0,
/// everything free.
fn pmm(frames: u64) -> FrameAllocator {
    let map = MemoryMap::new()
        .with_region(PhysicalAddress::zero(), frames * 4096)
        .with_free(PhysicalAddress::zero(), frames * 4096);
    FrameAllocator::from_map(&map)
}

// 256 B objects force order-1 slabs: (2 * 4096 - 16) / 256 = 31 objects.
const OBJ: usize = 256;
const CAP: u64 = 31;

#[test]
fn slots_are_distinct_aligned_and_recycled() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let total = frames.available_frames();
    let cache = SlabCache::new(&phys, OBJ, 8).expect("cache");
    assert_eq!(cache.slab_order(), 1);
    assert_eq!(u64::from(cache.slab_capacity()), CAP);

    // More objects than one slab holds; the cache must grow.
    let mut slots = Vec::new();
    for _ in 0..CAP + 4 {
        slots.push(cache.allocate(&frames).expect("alloc"));
    }
    assert_eq!(cache.slab_count(), 2);
    assert_eq!(cache.live_objects(), CAP + 4);
    assert_eq!(
        cache.live_objects() + cache.free_objects(),
        cache.slab_count() as u64 * CAP
    );

    for (i, a) in slots.iter().enumerate() {
        assert_eq!(a.as_u64() % 8, 0);
        for b in &slots[i + 1..] {
            assert_ne!(a, b, "slot handed out twice");
        }
    }

    // Scrambled frees, then shrink: the pool must fully recover.
    slots.reverse();
    slots.swap(1, 20);
    for slot in slots {
        cache.free(slot).expect("free");
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.shrink(&frames), 2);
    assert_eq!(cache.slab_count(), 0);
    assert_eq!(frames.available_frames(), total);
}

#[test]
fn slab_at_address_zero_serves_every_slot() {
    // The first buddy block is the one at frame 0, so the embedded free
    // list starts at physical address zero; that must read as a usable
    // slot, not as an exhausted list.
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache = SlabCache::new(&phys, OBJ, 8).expect("cache");

    let first = cache.allocate(&frames).expect("first slot");
    assert_eq!(first, PhysicalAddress::zero());

    // Drain the slab completely, then bring every slot back.
    let mut rest = Vec::new();
    for _ in 1..CAP {
        rest.push(cache.allocate(&frames).expect("alloc"));
    }
    assert_eq!(cache.free_objects(), 0);

    cache.free(first).expect("free first");
    for slot in rest {
        cache.free(slot).expect("free");
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.shrink(&frames), 1);
}

#[test]
fn partial_slabs_are_preferred_over_growth() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache = SlabCache::new(&phys, OBJ, 8).expect("cache");

    let a = cache.allocate(&frames).expect("a");
    let b = cache.allocate(&frames).expect("b");
    cache.free(a).expect("free a");

    // The freed slot comes back before any new slab is created.
    let c = cache.allocate(&frames).expect("c");
    assert_eq!(cache.slab_count(), 1);
    cache.free(b).expect("free b");
    cache.free(c).expect("free c");
}

#[test]
fn full_slabs_rotate_through_the_lists() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache = SlabCache::new(&phys, OBJ, 8).expect("cache");

    let mut slots = Vec::new();
    for _ in 0..CAP {
        slots.push(cache.allocate(&frames).expect("alloc"));
    }
    assert_eq!(cache.slab_count(), 1);
    assert_eq!(cache.free_objects(), 0, "slab must be on the full list");

    let one = slots.pop().expect("slot");
    cache.free(one).expect("free");
    assert_eq!(cache.free_objects(), 1, "slab must be partial again");

    for slot in slots {
        cache.free(slot).expect("free");
    }
    assert_eq!(cache.shrink(&frames), 1);
}

#[test]
fn foreign_and_misaligned_pointers_are_rejected() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache = SlabCache::new(&phys, OBJ, 8).expect("cache");
    let slot = cache.allocate(&frames).expect("alloc");

    // Outside every slab.
    let junk = PhysicalAddress::new(0x3_0000);
    assert_eq!(cache.free(junk), Err(CacheError::ForeignPointer(junk)));

    // Inside the slab but off the object stride.
    let skewed = slot + 7;
    assert_eq!(cache.free(skewed), Err(CacheError::ForeignPointer(skewed)));

    // On the stride but past the last object (header area).
    let base = PhysicalAddress::new(slot.as_u64() & !(2 * 4096 - 1));
    let past = base + CAP * OBJ as u64;
    assert_eq!(cache.free(past), Err(CacheError::ForeignPointer(past)));

    // The real slot is still fine.
    cache.free(slot).expect("free");
}

#[test]
fn growth_failure_is_typed() {
    let phys = TestPhys::with_frames(16);
    // 4096 B objects need an order-5 slab; 16 frames cannot supply one.
    let frames = pmm(16);
    let cache = SlabCache::new(&phys, 4096, 8).expect("cache");
    assert_eq!(cache.slab_order(), 5);
    assert_eq!(
        cache.allocate(&frames).unwrap_err(),
        CacheError::OutOfMemory(5)
    );
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Record {
    id: u64,
    weight: u32,
}

#[test]
fn typed_cache_round_trips_values() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache: ObjectCache<'_, _, Record> = ObjectCache::new(&phys).expect("cache");

    let mut refs = Vec::new();
    for id in 0..10 {
        let r = cache
            .allocate(&frames, Record { id, weight: 1 })
            .expect("alloc");
        refs.push(r);
    }
    for (id, r) in refs.iter().enumerate() {
        assert_eq!(cache.read(r), Record { id: id as u64, weight: 1 });
    }

    cache.write(&refs[3], Record { id: 3, weight: 9 });
    assert_eq!(cache.read(&refs[3]).weight, 9);
    assert_eq!(cache.read(&refs[2]).weight, 1, "neighbors untouched");

    for r in refs {
        cache.free(r);
    }
    assert_eq!(cache.live_objects(), 0);
    cache.release(&frames).expect("release");
}

#[test]
fn release_refuses_while_objects_live() {
    let phys = TestPhys::with_frames(64);
    let frames = pmm(64);
    let cache: ObjectCache<'_, _, Record> = ObjectCache::new(&phys).expect("cache");

    let _held = cache.allocate(&frames, Record { id: 1, weight: 0 }).expect("alloc");
    assert_eq!(cache.release(&frames), Err(CacheError::ObjectsLive(1)));
}
