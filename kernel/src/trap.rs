//! The core's face toward the external trap and interrupt collaborator.
//!
//! The IDT, the vector stubs, and the interrupt controllers live outside
//! the core. Their handlers call in here: the timer tick, the disk
//! completion interrupt, the system-call trap, and the two per-trap
//! checks the process model requires: a killed process exits at every
//! return to user space, and a process running in user mode yields on
//! every timer tick.

use crate::kernel::kernel;
use crate::proc::myproc;

/// Timer-tick handler: advance the clock and wake sleep(ticks) sleepers.
/// The boot CPU's timer interrupt calls this.
pub fn clock_intr() {
    kernel().tick();
}

/// Disk completion-interrupt handler.
pub fn disk_intr() {
    kernel().fs().disk_intr();
}

/// System-call trap entry: dispatch on the number in the trap frame.
pub fn handle_syscall() {
    crate::syscall::syscall();
}

/// Called on the way back to user space after any trap: a killed
/// process exits here instead of returning.
pub fn check_killed() {
    if let Some(p) = myproc() {
        if p.killed() {
            kernel().procs().exit_current();
        }
    }
}

/// Called after a timer tick that interrupted user code: round-robin
/// preemption.
pub fn yield_on_tick() {
    kernel().procs().yield_current();
}
