//! An owned physical page frame.

use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::addr::PGSIZE;

/// An owned 4 KiB frame, viewed through its kernel-virtual address.
///
/// # Safety
///
/// `ptr` is page-aligned, refers to `PGSIZE` valid bytes, and is uniquely
/// owned by this handle: it came from `Kmem::alloc` (or from
/// `Page::from_usize` on an address with the same provenance) and has not
/// been freed since.
pub struct Page {
    ptr: NonNull<[u8; PGSIZE]>,
}

// SAFETY: a `Page` is exclusive ownership of plain memory.
unsafe impl Send for Page {}

impl Page {
    /// Converts the page into its kernel-virtual address, giving up
    /// ownership without freeing.
    pub fn into_usize(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        mem::forget(self);
        addr
    }

    /// Reconstitutes a page from an address previously produced by
    /// `into_usize` (or an equivalent owned, page-aligned frame).
    ///
    /// # Safety
    ///
    /// `addr` must satisfy the type invariant: page-aligned, valid for
    /// `PGSIZE` bytes, and not owned by anything else.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0, "Page::from_usize");
        Self {
            // SAFETY: addr is nonzero by the alignment+ownership contract.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut _) },
        }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn write_bytes(&mut self, value: u8) {
        self.deref_mut().fill(value);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: type invariant.
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: type invariant; `&mut self` is exclusive.
        unsafe { self.ptr.as_mut() }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.addr())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // Pages must go back to the allocator explicitly; an implicit drop
        // would leak the frame silently.
        panic!("Page must never drop");
    }
}
