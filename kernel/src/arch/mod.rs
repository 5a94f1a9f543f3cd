//! Architecture-dependent code.
//!
//! The portable core consumes a fixed vocabulary from here: interrupt-flag
//! control, the per-CPU slot, context/trap-frame layouts and `swtch`, the
//! kernel memory map, physical<->kernel-virtual translation, and the
//! page-table register loads. `x86` is the real target; every other build
//! host gets `hosted`, a stand-in precise enough to run the core's unit
//! tests in user space.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86")] {
        pub mod x86;
        pub use x86::*;
    } else {
        pub mod hosted;
        pub use hosted::*;
    }
}

/// One contiguous piece of the kernel's virtual address map.
///
/// `setupkvm` installs each entry into every new page directory, so the
/// kernel half of the address space looks identical in every process.
#[derive(Clone, Copy)]
pub struct KmapEntry {
    pub virt: usize,
    pub pa_start: usize,
    pub size: usize,
    pub writable: bool,
}
