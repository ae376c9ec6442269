//! Local interrupt masking.
//!
//! On one CPU the only concurrency is the interrupt handler, so code that
//! shares state with it must mask interrupts around its critical sections;
//! a spin lock alone would deadlock the moment the timer fires inside one.
//! The capability is a trait so the scheduler stays host-testable: kernel
//! code plugs in [`LocalIrq`] (`cli`/`sti`), hosted tests a recording stub.

/// Capability to mask interrupts on the current CPU.
///
/// Calls nest through the saved state: `restore` only re-enables when the
/// matching `save_disable` found interrupts enabled.
pub trait IrqControl {
    /// Mask interrupts, returning whether they were enabled before.
    #[must_use]
    fn save_disable(&self) -> bool;

    /// Restore the state a matching
    /// [`save_disable`](Self::save_disable) returned.
    fn restore(&self, enabled: bool);
}

impl<I: IrqControl> IrqControl for &I {
    fn save_disable(&self) -> bool {
        (**self).save_disable()
    }

    fn restore(&self, enabled: bool) {
        (**self).restore(enabled);
    }
}

/// Masking stub for contexts without maskable interrupts (hosted tests,
/// pre-interrupt bring-up).
#[derive(Copy, Clone, Debug, Default)]
pub struct NoIrq;

impl IrqControl for NoIrq {
    fn save_disable(&self) -> bool {
        true
    }

    fn restore(&self, _enabled: bool) {}
}

/// The real thing: `cli`/`sti` with the prior state read from `RFLAGS`.
///
/// # Safety & Privilege
///
/// Must only be used where `cli`/`sti` are legal (ring 0 or an equivalent
/// hypervisor context); from user space these instructions fault.
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalIrq;

#[cfg(target_arch = "x86_64")]
impl IrqControl for LocalIrq {
    fn save_disable(&self) -> bool {
        // IF is bit 9 of RFLAGS.
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            // Safety: see the type-level privilege contract.
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    fn restore(&self, enabled: bool) {
        if enabled {
            // Safety: see the type-level privilege contract.
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

/// Current `RFLAGS` value (via `pushfq`/`pop`).
#[cfg(target_arch = "x86_64")]
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    // Safety: reading the flags register has no side effects.
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}
