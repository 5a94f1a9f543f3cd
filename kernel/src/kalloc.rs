//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and pipe buffers. Allocates whole 4096-byte pages
//! from a singly-linked free list threaded through the pages themselves.
//!
//! Initialization happens in two stages: `init1` builds the list over the
//! region the bootstrap page table already maps, before locking is
//! meaningful; `init2` extends it over the rest of physical memory once
//! the full kernel map is installed.

use core::mem;
use core::ptr;

use crate::addr::{pgrounddown, pgroundup, PGSIZE};
use crate::lock::Spinlock;
use crate::page::Page;

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - The list has no cycle.
/// - If `head` is non-null it points to a valid free page, whose first
///   word is the next link; every page in the list lies in
///   [`low`, `high`) and no page appears twice.
pub struct Kmem {
    head: *mut Run,
    low: usize,
    high: usize,
}

// SAFETY: the raw pointers are only dereferenced while the surrounding
// Spinlock is held.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            low: usize::MAX,
            high: 0,
        }
    }

    /// Adds the pages in `[start, end)` (kernel-virtual) to the free list.
    ///
    /// # Safety
    ///
    /// The range must be unused memory, not overlapping any page already
    /// given to the allocator, and must stay valid forever.
    unsafe fn free_range(&mut self, start: usize, end: usize) {
        let start = pgroundup(start);
        let end = pgrounddown(end);
        if start >= end {
            return;
        }
        self.low = self.low.min(start);
        self.high = self.high.max(end);
        for va in num_iter::range_step(start, end, PGSIZE) {
            // SAFETY: the page is unused and page-aligned per the caller's
            // contract.
            self.free(unsafe { Page::from_usize(va) });
        }
    }

    pub fn free(&mut self, mut page: Page) {
        let addr = page.addr();
        if addr % PGSIZE != 0 || addr < self.low || addr >= self.high {
            // Forget the bogus handle so its drop guard cannot fire while
            // this panic unwinds.
            mem::forget(page);
            panic!("Kmem::free");
        }
        // Fill with junk to catch dangling references.
        page.write_bytes(1);
        let run = page.into_usize() as *mut Run;
        // SAFETY: the page is owned and unaliased; writing the link keeps
        // the list invariant.
        unsafe { (*run).next = self.head };
        self.head = run;
    }

    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head points at a valid free page by the invariant.
        let next = unsafe { (*self.head).next };
        let addr = mem::replace(&mut self.head, next) as usize;
        // SAFETY: the page leaves the list, so ownership is unique.
        Some(unsafe { Page::from_usize(addr) })
    }
}

impl Spinlock<Kmem> {
    /// Stage-1 initialization over the bootstrap-mapped region.
    ///
    /// # Safety
    ///
    /// Must run once, on one CPU, before any other allocator use.
    pub unsafe fn init1(&self, range: (usize, usize)) {
        // Single CPU, nothing else running: no locking yet.
        // SAFETY: exclusive access per the caller's contract.
        unsafe { (*self.get_mut_raw()).free_range(range.0, range.1) };
    }

    /// Stage-2 initialization over the remaining physical memory.
    ///
    /// # Safety
    ///
    /// The range must be fresh memory, mapped by the kernel page table.
    pub unsafe fn init2(&self, range: (usize, usize)) {
        let mut kmem = self.lock();
        // SAFETY: per the caller's contract.
        unsafe { kmem.free_range(range.0, range.1) };
    }

    pub fn alloc(&self) -> Option<Page> {
        self.lock().alloc()
    }

    pub fn free(&self, page: Page) {
        self.lock().free(page);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::addr::PGSIZE;

    #[repr(align(4096))]
    struct TestRam([u8; 64 * PGSIZE]);

    /// A fresh, leaked allocator over its own arena. Sized so that a few
    /// address spaces fit: on this target every page table carries the
    /// kernel map, which alone takes several table pages.
    pub(crate) fn fresh_kmem(pages: usize) -> &'static Spinlock<Kmem> {
        assert!(pages <= 64);
        let ram = Box::leak(Box::new(TestRam([0; 64 * PGSIZE])));
        let base = ram.0.as_ptr() as usize;
        let kmem = Box::leak(Box::new(Spinlock::new("KMEM", Kmem::new())));
        // SAFETY: the arena is leaked and unaliased.
        unsafe { kmem.init1((base, base + pages * PGSIZE)) };
        kmem
    }

    #[test]
    fn alloc_free_round_trip() {
        let kmem = fresh_kmem(4);
        let mut pages = Vec::new();
        for _ in 0..4 {
            pages.push(kmem.alloc().expect("alloc"));
        }
        assert!(kmem.alloc().is_none(), "pool exhausted");
        let addrs: Vec<usize> = pages.iter().map(|p| p.addr()).collect();
        for p in pages {
            kmem.free(p);
        }
        // LIFO reuse: the last freed page comes back first.
        let p = kmem.alloc().unwrap();
        assert_eq!(p.addr(), addrs[3]);
        kmem.free(p);
    }

    #[test]
    fn free_fills_with_junk() {
        let kmem = fresh_kmem(2);
        let mut p = kmem.alloc().unwrap();
        p.write_bytes(0xAA);
        let addr = p.addr();
        kmem.free(p);
        // Skip the embedded free-list link; the rest must be the sentinel.
        let junk = unsafe {
            core::slice::from_raw_parts((addr + core::mem::size_of::<usize>()) as *const u8, 64)
        };
        assert!(junk.iter().all(|&b| b == 1));
        let p = kmem.alloc().unwrap();
        kmem.free(p);
    }

    #[test]
    #[should_panic(expected = "Kmem::free")]
    fn free_out_of_range_is_fatal() {
        let kmem = fresh_kmem(1);
        let bogus = Box::leak(Box::new(TestRam([0; 64 * PGSIZE])));
        let addr = bogus.0.as_ptr() as usize + PGSIZE;
        // SAFETY: fabricated on purpose; free rejects it before use.
        kmem.free(unsafe { Page::from_usize(addr) });
    }
}
