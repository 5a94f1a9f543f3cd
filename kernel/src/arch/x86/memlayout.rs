//! Memory layout of the x86 target.
//!
//! The kernel lives in the high half: every page directory maps
//! [KERNBASE, KERNBASE+PHYSTOP) to physical [0, PHYSTOP), plus the
//! memory-mapped device space near the top of the physical address range.

use crate::arch::KmapEntry;

/// Start of extended memory.
pub const EXTMEM: usize = 0x100000;

/// Top of physical memory.
pub const PHYSTOP: usize = 0xE000000;

/// Other devices are at high addresses.
pub const DEVSPACE: usize = 0xFE000000;

/// First kernel virtual address.
pub const KERNBASE: usize = 0x80000000;

/// Address where the kernel is linked.
pub const KERNLINK: usize = KERNBASE + EXTMEM;

pub const fn v2p(va: usize) -> usize {
    va - KERNBASE
}

pub const fn p2v(pa: usize) -> usize {
    pa + KERNBASE
}

extern "C" {
    /// First address after kernel text and rodata, defined by kernel.ld.
    static mut data: [u8; 0];

    /// First address after the kernel image, defined by kernel.ld.
    static mut end: [u8; 0];
}

/// The entries `setupkvm` installs in every page directory.
pub fn kmap() -> [KmapEntry; 4] {
    // SAFETY: taking the address of a linker symbol.
    let data = unsafe { data.as_ptr() as usize };
    [
        // I/O space
        KmapEntry {
            virt: KERNBASE,
            pa_start: 0,
            size: EXTMEM,
            writable: true,
        },
        // kernel text and rodata
        KmapEntry {
            virt: KERNLINK,
            pa_start: v2p(KERNLINK),
            size: data - KERNLINK,
            writable: false,
        },
        // kernel data and free physical memory
        KmapEntry {
            virt: data,
            pa_start: v2p(data),
            size: p2v(PHYSTOP) - data,
            writable: true,
        },
        // memory-mapped devices
        KmapEntry {
            virt: DEVSPACE,
            pa_start: DEVSPACE,
            size: 0usize.wrapping_sub(DEVSPACE),
            writable: true,
        },
    ]
}

/// Free-page pool available before the full kernel map is installed: the
/// bootstrap page table maps only the first 4 MiB of physical memory.
pub fn bootstrap_heap() -> (usize, usize) {
    // SAFETY: taking the address of a linker symbol.
    let end = unsafe { end.as_ptr() as usize };
    (end, p2v(4 * 1024 * 1024))
}

/// The rest of physical memory, usable once the kernel map covers it.
pub fn extended_heap() -> (usize, usize) {
    (p2v(4 * 1024 * 1024), p2v(PHYSTOP))
}
