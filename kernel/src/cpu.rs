//! Per-CPU state and the interrupt-disable nesting discipline.
//!
//! `pushcli`/`popcli` are like `intr_off`/`intr_on` except that they are
//! matched: it takes two `popcli`s to undo two `pushcli`s, and interrupts
//! are restored only if they were enabled before the first `pushcli`. Every
//! spinlock acquisition runs under a `pushcli`, which is what makes it safe
//! to share a spinlock between thread code and interrupt handlers on the
//! same CPU.

use crate::arch;

/// Per-CPU state. Mutated only by the owning CPU with interrupts disabled,
/// which is why the accessors below hand out raw pointers rather than
/// references.
pub struct Cpu {
    /// Scheduler context; `swtch` back here to enter the scheduler loop.
    pub scheduler: *mut arch::Context,

    /// Index of the process running on this CPU, if any.
    pub proc: Option<usize>,

    /// Depth of pushcli nesting.
    pub ncli: i32,

    /// Were interrupts enabled before the outermost pushcli?
    pub intena: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            scheduler: core::ptr::null_mut(),
            proc: None,
            ncli: 0,
            intena: false,
        }
    }
}

/// Pointer to the executing CPU's record.
///
/// The result is stable only while interrupts are disabled; with them
/// enabled a timer interrupt could move this thread to another CPU.
pub fn current_raw() -> *mut Cpu {
    arch::cpu_slot()
}

pub fn pushcli() {
    let old = arch::intr_get();
    // SAFETY: disabling interrupts is always sound.
    unsafe { arch::intr_off() };
    // SAFETY: interrupts are now off, so the record is ours alone.
    let cpu = unsafe { &mut *current_raw() };
    if cpu.ncli == 0 {
        cpu.intena = old;
    }
    cpu.ncli += 1;
}

pub fn popcli() {
    assert!(!arch::intr_get(), "popcli - interruptible");
    // SAFETY: interrupts are off, so the record is ours alone.
    let cpu = unsafe { &mut *current_raw() };
    cpu.ncli -= 1;
    assert!(cpu.ncli >= 0, "popcli");
    if cpu.ncli == 0 && cpu.intena {
        // SAFETY: restoring the state saved by the matching pushcli.
        unsafe { arch::intr_on() };
    }
}

/// Index of the process running on this CPU, if any.
pub fn current_proc_idx() -> Option<usize> {
    pushcli();
    // SAFETY: interrupts are off.
    let idx = unsafe { (*current_raw()).proc };
    popcli();
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;

    #[test]
    fn pushcli_nesting_restores_interrupts() {
        assert!(arch::intr_get());
        pushcli();
        assert!(!arch::intr_get());
        pushcli();
        popcli();
        assert!(!arch::intr_get());
        popcli();
        assert!(arch::intr_get());
    }

    #[test]
    fn pushcli_preserves_disabled_state() {
        // SAFETY: hosted target; per-thread flag.
        unsafe { arch::intr_off() };
        pushcli();
        popcli();
        assert!(!arch::intr_get());
        // SAFETY: as above.
        unsafe { arch::intr_on() };
    }
}
