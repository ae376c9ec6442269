//! The context transfer: the system's only suspension point.
//!
//! A suspended thread is nothing but its stack plus a [`SwitchFrame`] of
//! callee-preserved registers sitting on top of it, with the saved `rsp`
//! kept in its control block. Resuming pops the frame and returns; a
//! thread always wakes up exactly where it last called
//! [`switch_context`], whether that was a moment or a million ticks ago.
//!
//! First dispatch uses the same contract: creation seeds a synthetic
//! frame whose return address is [`thread_trampoline`] and whose
//! callee-saved registers carry the entry function, its argument, the
//! owning scheduler and the thread's identity.

use core::arch::naked_asm;

/// Callee-preserved register set, in the exact push order of
/// [`switch_context`] (lowest address first).
#[repr(C)]
pub(crate) struct SwitchFrame {
    pub rflags: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    /// Return address; the trampoline on first dispatch.
    pub rip: u64,
}

/// Save the caller's callee-preserved state on its own stack, publish the
/// resulting stack pointer through `prev`, and resume the thread whose
/// frame is at `next`.
///
/// # Safety
/// `prev` must be a valid place to store the suspended context and `next`
/// must point at a well-formed [`SwitchFrame`] on an otherwise unused
/// stack. Exactly one CPU may run either thread.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(prev: *mut *mut SwitchFrame, next: *mut SwitchFrame) {
    naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        "mov [rdi], rsp",
        // From here on we run on the new thread's stack.
        "mov rsp, rsi",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    )
}

/// First-dispatch shim. Moves the entry triple and thread identity from
/// the seeded callee-saved registers into argument registers and calls
/// the dispatch adapter whose address creation left in `r12`. The call
/// keeps the stack at the ABI-required alignment; the adapter never
/// returns.
#[unsafe(naked)]
pub(crate) extern "C" fn thread_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r15",
        "mov rsi, r14",
        "mov rdx, r13",
        "mov rcx, rbx",
        "call r12",
        "ud2",
    )
}
