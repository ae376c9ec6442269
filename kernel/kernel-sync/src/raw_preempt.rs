use crate::{Preempter, RawLock, RawUnlock};

/// Uniprocessor "spinlock": acquisition disables preemption, release
/// re-enables it.
///
/// With a single CPU, the only way another thread can enter the critical
/// section is by preempting the holder, so suppressing preemption *is* the
/// exclusion. There is nothing to spin on; acquisition always succeeds and
/// is O(1).
///
/// Nested acquisition of different `RawPreempt` locks is fine: the
/// preemption counter nests. Acquiring the *same* lock twice from one
/// thread is also harmless for exclusion, but the usual single-acquire
/// discipline applies for the data it protects.
pub struct RawPreempt<P> {
    preempter: P,
}

impl<P: Preempter> RawPreempt<P> {
    #[must_use]
    pub const fn new(preempter: P) -> Self {
        Self { preempter }
    }
}

impl<P: Preempter> RawLock for RawPreempt<P> {
    #[inline]
    fn raw_lock(&self) {
        self.preempter.disable_preemption();
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        // Uncontended by construction.
        self.preempter.disable_preemption();
        true
    }
}

impl<P: Preempter> RawUnlock for RawPreempt<P> {
    #[inline]
    unsafe fn raw_unlock(&self) {
        self.preempter.enable_preemption();
    }
}
