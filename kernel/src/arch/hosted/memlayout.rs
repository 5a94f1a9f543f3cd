//! Memory layout of the hosted target: a static 16 MiB arena stands in for
//! physical memory, and physical addresses are simply host addresses
//! (`p2v`/`v2p` are the identity). `KERNBASE` still bounds user virtual
//! addresses, and stays below what a two-level table can map with
//! host-width entries.

use core::ptr::addr_of_mut;

use crate::arch::KmapEntry;

/// First kernel virtual address; the ceiling for user mappings.
pub const KERNBASE: usize = 0x2000_0000;

const SIM_RAM_SIZE: usize = 16 * 1024 * 1024;

#[repr(align(4096))]
struct SimRam([u8; SIM_RAM_SIZE]);

static mut SIM_RAM: SimRam = SimRam([0; SIM_RAM_SIZE]);

pub const fn v2p(va: usize) -> usize {
    va
}

pub const fn p2v(pa: usize) -> usize {
    pa
}

fn ram_base() -> usize {
    // SAFETY: taking only the address of the arena.
    unsafe { addr_of_mut!(SIM_RAM) as usize }
}

/// The kernel map has a single entry covering the simulated RAM.
pub fn kmap() -> [KmapEntry; 1] {
    [KmapEntry {
        virt: KERNBASE,
        pa_start: ram_base(),
        size: SIM_RAM_SIZE,
        writable: true,
    }]
}

/// The whole arena is available from the first allocator stage.
pub fn bootstrap_heap() -> (usize, usize) {
    (ram_base(), ram_base() + SIM_RAM_SIZE)
}

/// Nothing is held back for a second stage on the hosted target.
pub fn extended_heap() -> (usize, usize) {
    let top = ram_base() + SIM_RAM_SIZE;
    (top, top)
}
