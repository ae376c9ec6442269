//! # Thread Scheduler
//!
//! A preemptible cooperative scheduler for one logical CPU. Parallelism is
//! simulated by interleaving: the only suspension point anywhere is the
//! hand-written context transfer inside [`Scheduler::schedule`], so kernel
//! code never observes true concurrency, only well-defined switch points.
//!
//! The ready queue is strict FIFO. A per-CPU preemption-disable counter
//! turns `schedule()` into a no-op while positive, which is how the lock
//! primitives keep the timer tick out of their critical sections. The boot
//! context is registered as thread 0 and doubles as the idle thread: it is
//! the fallback whenever every other thread is blocked, and it never
//! migrates away from the boot address space.
//!
//! The blocking primitives in `kernel-sync` stay scheduler-agnostic; this
//! crate implements their [`Preempter`](kernel_sync::Preempter) and
//! [`Parker`](kernel_sync::Parker) capabilities.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod scheduler;
mod switch;

pub use scheduler::{Scheduler, ThreadEntry};

use kernel_vmem::RootPage;

/// Thread lifecycle. `Finished` is the window between `exit` and the
/// moment the scheduler has switched off the exiting thread's stack; only
/// then is the thread `Dead` and safe to reap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Active,
    Blocked,
    Finished,
    Dead,
}

/// Stable handle to one thread slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// The boot context, registered at setup; also the idle thread.
    pub const BOOT: Self = Self(0);

    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Per-dispatch hardware reload.
///
/// Called by the thread that just regained the CPU, after scheduler
/// bookkeeping. The kernel's implementation reloads CR3 from `space` (when
/// the thread owns an address space) and points the privileged stack at
/// the thread's own stack top; host tests use [`NoHook`].
pub trait ResumeHook {
    fn thread_resumed(&self, thread: ThreadId, space: Option<RootPage>);
}

/// Hook that reloads nothing.
pub struct NoHook;

impl ResumeHook for NoHook {
    fn thread_resumed(&self, _thread: ThreadId, _space: Option<RootPage>) {}
}

/// Thread creation failure. Everything already allocated for the thread
/// has been released again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("out of physical memory")]
    OutOfMemory,
}
