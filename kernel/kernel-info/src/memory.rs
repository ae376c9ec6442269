//! # Memory Layout

/// Base page granularity, log2.
pub const PAGE_SHIFT: u32 = 12;

/// Base page granularity in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Largest buddy block order. An order-`MAX_ORDER` block spans
/// `2^MAX_ORDER` frames (4 GiB at 4 KiB pages).
pub const MAX_ORDER: u32 = 20;

/// First VA past the userspace half (`1 << 47`). User mappings live
/// strictly below this; the kernel half begins at the canonical mirror.
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// Where the kernel half begins (first canonical higher-half address).
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// Base of the fixed-offset physical window in the kernel half.
/// Anything mapped at [`PHYS_WINDOW_BASE`] + `pa` lets the kernel access
/// physical memory via a constant offset.
pub const PHYS_WINDOW_BASE: u64 = 0xffff_8880_0000_0000;

/// Buddy order of a freshly created thread's kernel stack
/// (`2^3` frames = 32 KiB).
pub const DEFAULT_STACK_ORDER: u32 = 3;

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(MAX_ORDER <= 32);
    assert!(USER_TOP == 1 << 47);
    assert!(USER_TOP.is_multiple_of(PAGE_SIZE));
    assert!(PHYS_WINDOW_BASE >= KERNEL_BASE);
    assert!(DEFAULT_STACK_ORDER <= MAX_ORDER);
};
