//! Scheduler state machine and thread lifecycle operations.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::mem::take;
use core::ptr;
use kernel_info::memory::{DEFAULT_STACK_ORDER, PAGE_SIZE};
use kernel_info::sched::TIMESLICE_TICKS;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_mm::{MemorySpace, Vma};
use kernel_slab::ObjectCache;
use kernel_sync::{IrqControl, NoIrq, Parker, Preempter, SpinLock};
use kernel_vmem::{FrameSource, PhysMapper, RootPage};
use log::{trace, warn};

use crate::switch::{SwitchFrame, switch_context, thread_trampoline};
use crate::{NoHook, ResumeHook, SpawnError, ThreadId, ThreadState};

/// A thread body. Runs on the thread's own stack; its return value is the
/// thread's exit code.
pub type ThreadEntry = extern "C" fn(usize) -> i32;

/// Signature of the first-dispatch adapter seeded into `r12`.
type DispatchAdapter = extern "C" fn(*const (), ThreadEntry, usize, u64) -> !;

/// One thread's control block. Slots own everything the thread holds:
/// its stack block, its address space, and the queue of joiners waiting
/// for it to die.
struct Tcb<'m, M: PhysMapper> {
    state: ThreadState,
    /// Saved stack pointer while suspended; garbage while running.
    context: *mut SwitchFrame,
    stack: Option<PhysicalPage<Size4K>>,
    stack_order: u32,
    space: Option<MemorySpace<'m, M>>,
    retval: i32,
    joiners: VecDeque<ThreadId>,
}

struct Inner<'m, M: PhysMapper> {
    /// Slot arena; a [`ThreadId`] is an index in here.
    threads: Vec<Option<Tcb<'m, M>>>,
    /// Strict FIFO ready queue. The running thread is never on it.
    ready: VecDeque<ThreadId>,
    current: ThreadId,
    /// Ticks left in the current thread's timeslice.
    remaining: u64,
    /// While positive, `schedule()` is a no-op.
    preempt_count: u32,
}

impl<'m, M: PhysMapper> Inner<'m, M> {
    fn slot(&self, id: ThreadId) -> Option<&Tcb<'m, M>> {
        self.threads.get(id.index()).and_then(Option::as_ref)
    }

    fn tcb(&self, id: ThreadId) -> &Tcb<'m, M> {
        match self.slot(id) {
            Some(tcb) => tcb,
            // current and the ready queue only ever hold live slots.
            None => unreachable!("vacant thread slot {id:?}"),
        }
    }

    fn tcb_mut(&mut self, id: ThreadId) -> &mut Tcb<'m, M> {
        match self.threads.get_mut(id.index()).and_then(Option::as_mut) {
            Some(tcb) => tcb,
            None => unreachable!("vacant thread slot {id:?}"),
        }
    }

    fn vacant_slot(&mut self) -> ThreadId {
        for (index, slot) in self.threads.iter().enumerate() {
            if slot.is_none() {
                return ThreadId::from_index(index);
            }
        }
        self.threads.push(None);
        ThreadId::from_index(self.threads.len() - 1)
    }
}

/// The scheduler for one logical CPU.
///
/// The boot context is registered as [`ThreadId::BOOT`] at construction
/// and doubles as the idle thread. Once any thread has been spawned the
/// scheduler must not move in memory: seeded contexts carry its address.
///
/// Every state update runs with interrupts masked through `irq`: the
/// timer tick re-enters [`schedule`](Self::schedule) on the interrupted
/// thread's stack, so on one CPU the inner lock alone would deadlock
/// against it. Masking also spans the hole between releasing the lock and
/// the context switch itself.
pub struct Scheduler<'m, M: PhysMapper, H: ResumeHook = NoHook, I: IrqControl = NoIrq> {
    mapper: &'m M,
    records: &'m ObjectCache<'m, M, Vma>,
    kernel_template: Option<RootPage>,
    hook: H,
    irq: I,
    inner: SpinLock<Inner<'m, M>>,
}

impl<'m, M: PhysMapper> Scheduler<'m, M> {
    /// Set up a scheduler without a hardware reload hook or interrupt
    /// masking (host tests, early bring-up).
    pub fn new(
        mapper: &'m M,
        records: &'m ObjectCache<'m, M, Vma>,
        kernel_template: Option<RootPage>,
    ) -> Self {
        Self::with_masking(mapper, records, kernel_template, NoHook, NoIrq)
    }
}

impl<'m, M: PhysMapper, H: ResumeHook> Scheduler<'m, M, H> {
    /// Set up a scheduler whose dispatches reload hardware state through
    /// `hook`, without interrupt masking.
    pub fn with_hook(
        mapper: &'m M,
        records: &'m ObjectCache<'m, M, Vma>,
        kernel_template: Option<RootPage>,
        hook: H,
    ) -> Self {
        Self::with_masking(mapper, records, kernel_template, hook, NoIrq)
    }
}

impl<'m, M: PhysMapper, H: ResumeHook, I: IrqControl> Scheduler<'m, M, H, I> {
    /// The full constructor: hardware reload through `hook`, interrupt
    /// masking through `irq`. The calling context becomes thread 0.
    pub fn with_masking(
        mapper: &'m M,
        records: &'m ObjectCache<'m, M, Vma>,
        kernel_template: Option<RootPage>,
        hook: H,
        irq: I,
    ) -> Self {
        let boot = Tcb {
            state: ThreadState::Active,
            context: ptr::null_mut(),
            stack: None,
            stack_order: 0,
            space: None,
            retval: 0,
            joiners: VecDeque::new(),
        };
        let mut threads = Vec::new();
        threads.push(Some(boot));
        Self {
            mapper,
            records,
            kernel_template,
            hook,
            irq,
            inner: SpinLock::new(Inner {
                threads,
                ready: VecDeque::new(),
                current: ThreadId::BOOT,
                remaining: TIMESLICE_TICKS,
                preempt_count: 0,
            }),
        }
    }

    /// Run `f` on the scheduler state with interrupts masked for the
    /// duration. Every lock acquisition goes through here.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<'m, M>) -> R) -> R {
        let was = self.irq.save_disable();
        let result = f(&mut self.inner.lock());
        self.irq.restore(was);
        result
    }

    /// Create a thread with the default stack, not yet runnable; follow up
    /// with [`start`](Self::start).
    ///
    /// # Errors
    /// [`SpawnError::OutOfMemory`]; every allocation already made for the
    /// thread has been released again.
    pub fn spawn(
        &self,
        frames: &impl FrameSource,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<ThreadId, SpawnError> {
        self.spawn_with_stack(frames, DEFAULT_STACK_ORDER, entry, arg)
    }

    /// Create a thread with a `2^stack_order`-frame stack and its own
    /// address space, and seed the stack with a synthetic switch frame so
    /// that first dispatch goes through the ordinary resume path.
    ///
    /// # Errors
    /// [`SpawnError::OutOfMemory`] when the stack or the address space
    /// cannot be allocated.
    pub fn spawn_with_stack(
        &self,
        frames: &impl FrameSource,
        stack_order: u32,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<ThreadId, SpawnError> {
        let stack = frames
            .alloc_frames(stack_order)
            .ok_or(SpawnError::OutOfMemory)?;
        let space =
            match MemorySpace::create(self.mapper, frames, self.records, self.kernel_template) {
                Ok(space) => space,
                Err(_) => {
                    frames.free_frames(stack, stack_order);
                    return Err(SpawnError::OutOfMemory);
                }
            };

        let id = self.with_inner(|inner| {
            let id = inner.vacant_slot();

            let stack_bytes = PAGE_SIZE << stack_order;
            let frame_pa = stack.base() + (stack_bytes - size_of::<SwitchFrame>() as u64);
            let trampoline: extern "C" fn() -> ! = thread_trampoline;
            let adapter: DispatchAdapter = first_dispatch::<M, H, I>;
            // Safety: the frame sits at the top of the stack block just
            // allocated for this thread; nothing else references it yet.
            let frame: &mut SwitchFrame = unsafe { self.mapper.phys_to_mut(frame_pa) };
            *frame = SwitchFrame {
                // Bit 1 is the always-set flag; interrupts stay masked
                // until the dispatch path enables them.
                rflags: 0x2,
                r15: ptr::from_ref(self) as usize as u64,
                r14: entry as usize as u64,
                r13: arg as u64,
                r12: adapter as usize as u64,
                rbp: 0,
                rbx: u64::from(id.as_u32()),
                rip: trampoline as usize as u64,
            };

            inner.threads[id.index()] = Some(Tcb {
                state: ThreadState::Blocked,
                context: ptr::from_mut(frame),
                stack: Some(stack),
                stack_order,
                space: Some(space),
                retval: 0,
                joiners: VecDeque::new(),
            });
            id
        });
        trace!("spawned {id:?}, order-{stack_order} stack");
        Ok(id)
    }

    /// Make a spawned thread runnable for the first time.
    pub fn start(&self, id: ThreadId) {
        self.wake(id);
    }

    /// Mark the calling thread blocked. It keeps running until the next
    /// `schedule()`, which will not re-enqueue it.
    pub fn block(&self) {
        self.with_inner(|inner| {
            let me = inner.current;
            inner.tcb_mut(me).state = ThreadState::Blocked;
        });
    }

    /// Wake a blocked thread: mark it active and append it to the ready
    /// queue. Waking a thread that is not blocked is a no-op.
    pub fn wake(&self, id: ThreadId) {
        self.with_inner(|inner| {
            let Some(state) = inner.slot(id).map(|tcb| tcb.state) else {
                warn!("wake of unknown thread {id:?}");
                return;
            };
            if state == ThreadState::Blocked {
                inner.tcb_mut(id).state = ThreadState::Active;
                // The caller may wake a thread that was preempted between
                // announcing a park and parking; that thread is `current`
                // and must not appear on the ready queue as well.
                if id != inner.current {
                    inner.ready.push_back(id);
                }
            }
        });
    }

    /// Give up the CPU.
    ///
    /// No-op while preemption is disabled. Otherwise the head of the ready
    /// queue runs next; with an empty queue a no-longer-active caller
    /// falls back to the boot/idle thread, and an active caller simply
    /// keeps running with a fresh timeslice. An active non-idle caller
    /// that does switch away is re-enqueued at the tail.
    pub fn schedule(&self) {
        let was = self.irq.save_disable();
        if let Some((me, prev_ctx, next_ctx)) = self.pick_next() {
            // The lock is released before the transfer, but interrupts
            // stay masked until after `finish_switch`: a timer tick in
            // this window would re-enter here before the saved-context
            // write is in place.
            //
            // Safety: both pointers come from live control blocks and the
            // target context was stored by this same routine (or seeded
            // by spawn).
            unsafe { switch_context(prev_ctx, next_ctx) };
            self.finish_switch(me);
        }
        self.irq.restore(was);
    }

    /// Decide, under the lock, whether the caller gives up the CPU.
    /// `None` means it keeps running (possibly with a fresh timeslice).
    fn pick_next(&self) -> Option<(ThreadId, *mut *mut SwitchFrame, *mut SwitchFrame)> {
        let mut inner = self.inner.lock();
        if inner.preempt_count > 0 {
            return None;
        }
        let me = inner.current;
        let mut next = inner.ready.pop_front();
        if next.is_none() && inner.tcb(me).state != ThreadState::Active {
            next = Some(ThreadId::BOOT);
        }
        let Some(next) = next else {
            inner.remaining = TIMESLICE_TICKS;
            return None;
        };
        if next == me {
            inner.remaining = TIMESLICE_TICKS;
            return None;
        }
        if inner.tcb(me).state == ThreadState::Active && me != ThreadId::BOOT {
            inner.ready.push_back(me);
        }
        trace!("switch {me:?} -> {next:?}");
        let prev_ctx: *mut *mut SwitchFrame = ptr::from_mut(&mut inner.tcb_mut(me).context);
        let next_ctx: *mut SwitchFrame = inner.tcb(next).context;
        Some((me, prev_ctx, next_ctx))
    }

    /// Timer tick: burn one tick of the current timeslice and reschedule
    /// when it is used up. Called from the timer interrupt, on the
    /// interrupted thread's own stack.
    pub fn tick(&self) {
        let expired = self.with_inner(|inner| {
            inner.remaining = inner.remaining.saturating_sub(1);
            inner.remaining == 0
        });
        if expired {
            self.schedule();
        }
    }

    /// Terminate the calling thread with `retval`. The thread stays
    /// `Finished` until the scheduler has switched off its stack, then
    /// becomes `Dead` and wakes its joiners. Never returns; must not be
    /// called on the boot thread.
    pub fn exit(&self, retval: i32) -> ! {
        // Masked for good: a tick between marking the thread finished and
        // the final switch would reap a stack that is still running. The
        // next context restores its own flags.
        let _ = self.irq.save_disable();
        {
            let mut inner = self.inner.lock();
            let me = inner.current;
            debug_assert_ne!(me, ThreadId::BOOT, "boot thread cannot exit");
            let tcb = inner.tcb_mut(me);
            tcb.retval = retval;
            tcb.state = ThreadState::Finished;
        }
        loop {
            self.schedule();
        }
    }

    /// Wait until `target` is dead and collect its exit code. Returns
    /// `None` for a vacated slot.
    pub fn join(&self, target: ThreadId) -> Option<i32> {
        loop {
            let done = self.with_inner(|inner| {
                let me = inner.current;
                debug_assert_ne!(me, target, "self-join would deadlock");
                let Some(state) = inner.slot(target).map(|tcb| tcb.state) else {
                    return Some(None);
                };
                if state == ThreadState::Dead {
                    return Some(Some(inner.tcb(target).retval));
                }
                if !inner.tcb(target).joiners.contains(&me) {
                    inner.tcb_mut(target).joiners.push_back(me);
                }
                inner.tcb_mut(me).state = ThreadState::Blocked;
                None
            });
            if let Some(result) = done {
                return result;
            }
            self.schedule();
        }
    }

    /// Reclaim a dead thread: free its stack and release its address
    /// space. Destroying a live or unknown thread is refused.
    pub fn destroy(&self, frames: &impl FrameSource, id: ThreadId) {
        let reaped = self.with_inner(|inner| match inner.slot(id).map(|tcb| tcb.state) {
            Some(ThreadState::Dead) => inner.threads[id.index()].take(),
            Some(state) => {
                warn!("destroy of {id:?} in state {state:?} refused");
                None
            }
            None => {
                warn!("destroy of unknown thread {id:?}");
                None
            }
        });
        if let Some(tcb) = reaped {
            if let Some(stack) = tcb.stack {
                frames.free_frames(stack, tcb.stack_order);
            }
            if let Some(space) = tcb.space {
                space.release(frames);
            }
            trace!("destroyed {id:?}");
        }
    }

    /// The running thread.
    #[must_use]
    pub fn current_thread(&self) -> ThreadId {
        self.with_inner(|inner| inner.current)
    }

    /// Lifecycle state of `id`, `None` for a vacated slot.
    #[must_use]
    pub fn state_of(&self, id: ThreadId) -> Option<ThreadState> {
        self.with_inner(|inner| inner.slot(id).map(|tcb| tcb.state))
    }

    /// Live thread slots, the boot thread included.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.with_inner(|inner| {
            inner.threads.iter().filter(|slot| slot.is_some()).count()
        })
    }

    /// Bookkeeping run by whichever thread just regained the CPU: reap the
    /// predecessor if it finished, take over as current, refresh the
    /// timeslice, then reload hardware state through the hook. Runs with
    /// interrupts still masked by the switching-out side.
    fn finish_switch(&self, me: ThreadId) {
        let root = {
            let mut inner = self.inner.lock();
            let prev = inner.current;
            if inner.tcb(prev).state == ThreadState::Finished {
                inner.tcb_mut(prev).state = ThreadState::Dead;
                let joiners = take(&mut inner.tcb_mut(prev).joiners);
                for joiner in joiners {
                    if joiner == me {
                        inner.tcb_mut(joiner).state = ThreadState::Active;
                    } else if inner.tcb(joiner).state == ThreadState::Blocked {
                        inner.tcb_mut(joiner).state = ThreadState::Active;
                        inner.ready.push_back(joiner);
                    }
                }
                trace!("reaped {prev:?}");
            }
            inner.current = me;
            inner.remaining = TIMESLICE_TICKS;
            inner.tcb(me).space.as_ref().map(MemorySpace::root_page)
        };
        self.hook.thread_resumed(me, root);
    }
}

/// First code a new thread runs, entered from the trampoline with the
/// seeded registers as arguments. Completes the switch bookkeeping the
/// resume path would have done, enables interrupts, runs the thread body,
/// and exits with its return value.
extern "C" fn first_dispatch<M: PhysMapper, H: ResumeHook, I: IrqControl>(
    sched: *const (),
    entry: ThreadEntry,
    arg: usize,
    id: u64,
) -> ! {
    // Safety: spawn seeded this pointer with the owning scheduler, which
    // outlives every thread it runs.
    let sched = unsafe { &*sched.cast::<Scheduler<'_, M, H, I>>() };
    sched.finish_switch(ThreadId::from_index(id as usize));
    // The seeded frame carries IF=0; a fresh thread starts interruptible.
    sched.irq.restore(true);
    let retval = entry(arg);
    sched.exit(retval)
}

impl<M: PhysMapper, H: ResumeHook, I: IrqControl> Preempter for Scheduler<'_, M, H, I> {
    fn disable_preemption(&self) {
        self.with_inner(|inner| inner.preempt_count += 1);
    }

    fn enable_preemption(&self) {
        self.with_inner(|inner| {
            debug_assert!(inner.preempt_count > 0, "unbalanced enable_preemption");
            inner.preempt_count -= 1;
        });
    }
}

impl<M: PhysMapper, H: ResumeHook, I: IrqControl> Parker for Scheduler<'_, M, H, I> {
    type Id = ThreadId;

    fn current(&self) -> ThreadId {
        self.with_inner(|inner| inner.current)
    }

    fn prepare_park(&self) {
        self.block();
    }

    fn park(&self) {
        self.schedule();
    }

    fn unpark(&self, id: ThreadId) {
        self.wake(id);
    }
}
