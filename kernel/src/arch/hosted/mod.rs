//! Hosted stand-in target.
//!
//! Compiled whenever the build target is not 32-bit x86, so the portable
//! core (locks, allocator, VM, buffer cache, log, inode layer, pipes, the
//! process table) can run as ordinary user-space unit tests against a
//! simulated disk. Interrupt state and the "CPU" record are per-thread
//! under test; context switching itself is unreachable here.

pub mod memlayout;
pub mod proc;
#[cfg(test)]
pub mod sim;

pub use memlayout::*;
pub use proc::*;

use cfg_if::cfg_if;

use crate::cpu::Cpu;

/// Interrupt-enable bit in EFLAGS; mirrored so portable code can build
/// trap frames identically on both targets.
pub const FL_IF: u32 = 0x200;

cfg_if! {
    if #[cfg(test)] {
        use core::cell::{Cell, UnsafeCell};

        std::thread_local! {
            static CPU: UnsafeCell<Cpu> = const { UnsafeCell::new(Cpu::new()) };
            static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
        }

        /// Each test thread acts as its own CPU.
        pub fn cpu_slot() -> *mut Cpu {
            CPU.with(|c| c.get())
        }

        pub fn intr_get() -> bool {
            INTR_ENABLED.with(|c| c.get())
        }

        pub unsafe fn intr_on() {
            INTR_ENABLED.with(|c| c.set(true));
        }

        pub unsafe fn intr_off() {
            INTR_ENABLED.with(|c| c.set(false));
        }
    } else {
        use core::cell::UnsafeCell;
        use core::sync::atomic::{AtomicBool, Ordering};

        struct SingleCpu(UnsafeCell<Cpu>);

        // SAFETY: the non-test hosted build models a uniprocessor.
        unsafe impl Sync for SingleCpu {}

        static CPU: SingleCpu = SingleCpu(UnsafeCell::new(Cpu::new()));
        static INTR_ENABLED: AtomicBool = AtomicBool::new(true);

        pub fn cpu_slot() -> *mut Cpu {
            CPU.0.get()
        }

        pub fn intr_get() -> bool {
            INTR_ENABLED.load(Ordering::Relaxed)
        }

        pub unsafe fn intr_on() {
            INTR_ENABLED.store(true, Ordering::Relaxed);
        }

        pub unsafe fn intr_off() {
            INTR_ENABLED.store(false, Ordering::Relaxed);
        }
    }
}

pub fn cpu_id() -> usize {
    0
}

pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
