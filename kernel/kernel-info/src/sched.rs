//! # Scheduling policy

/// Timer ticks a thread may run before the tick handler forces a
/// reschedule.
pub const TIMESLICE_TICKS: u64 = 5;

const _: () = {
    assert!(TIMESLICE_TICKS > 0);
};
