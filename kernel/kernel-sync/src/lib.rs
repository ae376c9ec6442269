//! # Kernel synchronization primitives
//!
//! Lock behavior is split into small capability traits so containers stay
//! generic over the locking discipline:
//!
//! - [`RawLock`] / [`RawUnlock`] — acquire/release without knowing *how*
//!   exclusion is achieved. [`Mutex`] and [`Condvar`] only ever talk to
//!   these.
//! - [`RawSpin`] — atomic test-and-set spinning (usable anywhere, including
//!   host tests).
//! - [`RawPreempt`] — the uniprocessor discipline: "locking" disables
//!   preemption, so the critical section simply cannot be interleaved.
//! - [`RawHandoff`] — a fair blocking lock: contenders queue FIFO and
//!   ownership is handed directly to the longest waiter on release.
//!
//! The blocking primitives do not know the scheduler; they are generic over
//! the [`Preempter`] and [`Parker`] capabilities, which the scheduler crate
//! implements. This keeps the dependency arrow pointing one way.
//! [`IrqControl`] plays the same role for interrupt masking: the scheduler
//! consumes it, kernel code plugs in the `cli`/`sti` implementation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod condvar;
mod irq;
mod mutex;
mod raw_handoff;
mod raw_preempt;
mod raw_spin;
mod spin_lock;
mod sync_once_cell;

pub use condvar::Condvar;
#[cfg(target_arch = "x86_64")]
pub use irq::LocalIrq;
pub use irq::{IrqControl, NoIrq};
pub use mutex::{Mutex, MutexGuard};
pub use raw_handoff::RawHandoff;
pub use raw_preempt::RawPreempt;
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

use core::fmt;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// Uniprocessor mutex: exclusion by disabling preemption.
pub type PreemptMutex<T, P> = Mutex<T, RawPreempt<P>>;

/// Fair blocking mutex with FIFO direct handoff.
pub type HandoffMutex<T, P> = Mutex<T, RawHandoff<P>>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T, P: Preempter> PreemptMutex<T, P> {
    pub const fn with_preempter(preempter: P, value: T) -> Self {
        Self::from_raw(RawPreempt::new(preempter), value)
    }
}

impl<T, P: Parker> HandoffMutex<T, P> {
    pub fn with_parker(parker: P, value: T) -> Self {
        Self::from_raw(RawHandoff::new(parker), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must hold the lock.
    unsafe fn raw_unlock(&self);
}

/// Capability to suppress preemption for the calling thread.
///
/// Calls nest: preemption is re-enabled only when every `disable` has been
/// matched by an `enable`.
pub trait Preempter {
    fn disable_preemption(&self);
    fn enable_preemption(&self);
}

impl<P: Preempter> Preempter for &P {
    fn disable_preemption(&self) {
        (**self).disable_preemption();
    }

    fn enable_preemption(&self) {
        (**self).enable_preemption();
    }
}

/// Capability to block and wake threads.
///
/// Implemented by the scheduler. The two-phase `prepare_park`/`park` split
/// closes the wake-before-sleep race: after `prepare_park`, an `unpark`
/// from anywhere is remembered and the following `park` returns without
/// sleeping.
pub trait Parker {
    /// Stable identity of a thread; valid as an `unpark` target for as long
    /// as the thread exists.
    type Id: Copy + Eq + fmt::Debug;

    /// The calling thread's identity.
    fn current(&self) -> Self::Id;

    /// Announce that the calling thread is about to park.
    fn prepare_park(&self);

    /// Block until unparked. May wake spuriously; callers recheck their
    /// predicate.
    fn park(&self);

    /// Wake `id` if it is parked or about to park.
    fn unpark(&self, id: Self::Id);
}

impl<P: Parker> Parker for &P {
    type Id = P::Id;

    fn current(&self) -> Self::Id {
        (**self).current()
    }

    fn prepare_park(&self) {
        (**self).prepare_park();
    }

    fn park(&self) {
        (**self).park();
    }

    fn unpark(&self, id: Self::Id) {
        (**self).unpark(id);
    }
}
