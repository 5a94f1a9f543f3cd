//! Virtual memory: two-level page tables, the kernel address map, and
//! per-process user address spaces.
//!
//! Every page directory maps the kernel half identically (`install_kmap`),
//! so the kernel keeps running no matter which process's table is loaded.
//! The user half covers [0, size) contiguously; `UserMemory` owns both the
//! table pages and the mapped frames, and every frame it maps (kernel
//! entries aside) came from the page allocator, which is what makes
//! `copy_out`/`copy_in`/`free` sound.

use core::cmp;
use core::marker::PhantomData;
use core::slice;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::addr::{
    pgrounddown, pgroundup, Addr, KVAddr, PAddr, UVAddr, VAddr, MAXVA_BITS, NPTENTRIES, PGSIZE,
};
use crate::arch::{self, KERNBASE};
use crate::fs::InodeGuard;
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::page::Page;

bitflags! {
    /// x86 page-table entry flags (the subset the kernel uses).
    pub struct PteFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Writeable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
    }
}

/// # Safety
///
/// If `is_present()`, `inner` holds a physical page number with valid
/// flags; directory-level entries always refer to page-table pages.
#[derive(Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn get_flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn get_pa(&self) -> PAddr {
        PAddr::from(self.inner & !(PGSIZE - 1))
    }

    fn is_present(&self) -> bool {
        self.get_flags().contains(PteFlags::P)
    }

    fn is_user(&self) -> bool {
        self.get_flags().contains(PteFlags::P | PteFlags::U)
    }

    /// Make the entry refer to a page-table page. Directory entries are
    /// fully permissive; leaf entries enforce the real permissions.
    fn set_table(&mut self, pa: PAddr) {
        self.inner = pa.into_usize() | (PteFlags::P | PteFlags::W | PteFlags::U).bits();
    }

    fn set_entry(&mut self, pa: PAddr, perm: PteFlags) {
        self.inner = pa.into_usize() | (perm | PteFlags::P).bits();
    }

    /// Strip the user-accessible bit; used to put a guard page below the
    /// user stack.
    fn clear_user(&mut self) {
        self.inner &= !PteFlags::U.bits();
    }

    fn invalidate(&mut self) {
        self.inner = 0;
    }
}

/// One page worth of page-table entries: a page directory or a page table,
/// depending on the level it is reached at.
///
/// # Safety
///
/// The backing page came from the allocator and can be turned back into a
/// `Page` with `Page::from_usize`.
struct RawPageTable {
    inner: [PageTableEntry; NPTENTRIES],
}

impl RawPageTable {
    /// Allocate a new zeroed table page. A zero entry is not present, so
    /// the fresh table maps nothing.
    fn new(allocator: &Spinlock<Kmem>) -> Option<*mut RawPageTable> {
        let mut page = allocator.alloc()?;
        page.write_bytes(0);
        Some(page.into_usize() as *mut RawPageTable)
    }

    /// Return the next-level table for `index`, allocating it if `alloc`.
    fn get_table_mut(
        &mut self,
        index: usize,
        alloc: bool,
        allocator: &Spinlock<Kmem>,
    ) -> Option<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if !pte.is_present() {
            if !alloc {
                return None;
            }
            let table = Self::new(allocator)?;
            pte.set_table(PAddr::from(arch::v2p(table as usize)));
        }
        // SAFETY: a present directory entry refers to a table page by the
        // invariant; p2v makes it kernel-reachable.
        Some(unsafe { &mut *(arch::p2v(pte.get_pa().into_usize()) as *mut RawPageTable) })
    }

    fn get_entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.inner[index]
    }

    /// Free this table page and, at directory level, every table page it
    /// refers to. Leaf data pages must already have been removed.
    ///
    /// # Safety
    ///
    /// `table` must not be used again, and `is_dir` must be accurate.
    unsafe fn free_walk(table: *mut RawPageTable, is_dir: bool, allocator: &Spinlock<Kmem>) {
        if is_dir {
            // SAFETY: valid table per the contract.
            for pte in unsafe { &mut (*table).inner } {
                if pte.is_present() {
                    let sub = arch::p2v(pte.get_pa().into_usize()) as *mut RawPageTable;
                    // SAFETY: directory entries refer to table pages.
                    unsafe { Self::free_walk(sub, false, allocator) };
                    pte.invalidate();
                }
            }
        }
        // SAFETY: the backing page came from the allocator (invariant).
        allocator.free(unsafe { Page::from_usize(table as usize) });
    }
}

/// # Safety
///
/// `ptr` uniquely refers to a valid two-level page table.
pub struct PageTable<A: VAddr> {
    ptr: *mut RawPageTable,
    _marker: PhantomData<A>,
}

impl<A: VAddr> PageTable<A> {
    fn new(allocator: &Spinlock<Kmem>) -> Option<Self> {
        Some(Self {
            ptr: RawPageTable::new(allocator)?,
            _marker: PhantomData,
        })
    }

    /// Kernel-virtual address of the page directory.
    fn as_usize(&self) -> usize {
        self.ptr as usize
    }

    /// Return the leaf PTE for virtual address `va`. If `alloc`, create
    /// the intermediate page-table page on demand.
    fn get_mut(
        &mut self,
        va: A,
        alloc: bool,
        allocator: &Spinlock<Kmem>,
    ) -> Option<&mut PageTableEntry> {
        assert_eq!(
            va.into_usize().checked_shr(MAXVA_BITS as u32).unwrap_or(0),
            0,
            "PageTable::get_mut"
        );
        // SAFETY: self.ptr is valid by the invariant.
        let dir = unsafe { &mut *self.ptr };
        let table = dir.get_table_mut(va.pdx(), alloc, allocator)?;
        Some(table.get_entry_mut(va.ptx()))
    }

    fn insert(
        &mut self,
        va: A,
        pa: PAddr,
        perm: PteFlags,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let a = pgrounddown(va.into_usize());
        let pte = self.get_mut(A::from(a), true, allocator).ok_or(())?;
        assert!(!pte.is_present(), "remap");
        pte.set_entry(pa, perm);
        Ok(())
    }

    /// Create PTEs for [va, va+size) referring to physical addresses
    /// starting at pa. va and size need not be page-aligned. Fails if a
    /// page-table page cannot be allocated; panics on an existing mapping.
    fn insert_range(
        &mut self,
        va: A,
        size: usize,
        pa: PAddr,
        perm: PteFlags,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let start = pgrounddown(va.into_usize());
        // (size - 1) first: virt + size can sit exactly at the top of the
        // 32-bit address space.
        let end = pgrounddown(va.into_usize() + (size - 1));
        for i in num_iter::range_step_inclusive(0, end - start, PGSIZE) {
            self.insert(A::from(start + i), pa + i, perm, allocator)?;
        }
        Ok(())
    }

    /// Remove the mapping for `va` and return the physical address it
    /// referred to.
    fn remove(&mut self, va: A, allocator: &Spinlock<Kmem>) -> Option<PAddr> {
        let pte = self.get_mut(va, false, allocator)?;
        if !pte.is_present() {
            return None;
        }
        let pa = pte.get_pa();
        pte.invalidate();
        Some(pa)
    }

    /// Install the kernel mappings shared by every address space.
    fn install_kmap(&mut self, allocator: &Spinlock<Kmem>) -> Result<(), ()> {
        for k in arch::kmap().iter() {
            let perm = if k.writable {
                PteFlags::W
            } else {
                PteFlags::empty()
            };
            self.insert_range(
                A::from(k.virt),
                k.size,
                PAddr::from(k.pa_start),
                perm,
                allocator,
            )?;
        }
        Ok(())
    }

    /// Free every page-table page. All user data pages must already have
    /// been removed and freed.
    fn free_walk(self, allocator: &Spinlock<Kmem>) {
        // SAFETY: self is consumed; the root is a directory.
        unsafe { RawPageTable::free_walk(self.ptr, true, allocator) };
    }
}

/// The address space the scheduler runs on: kernel mappings only.
pub struct KernelMemory {
    page_table: PageTable<KVAddr>,
}

// SAFETY: immutable after boot; `switch` only reads the root address.
unsafe impl Sync for KernelMemory {}
unsafe impl Send for KernelMemory {}

impl KernelMemory {
    /// Build the kernel-only page table (one per machine).
    pub fn new(allocator: &Spinlock<Kmem>) -> Option<Self> {
        let page_table = PageTable::new(allocator)?;
        let mut mem = scopeguard::guard(Self { page_table }, |m| {
            m.page_table.free_walk(allocator);
        });
        mem.page_table.install_kmap(allocator).ok()?;
        Some(scopeguard::ScopeGuard::into_inner(mem))
    }

    /// Switch the hardware page-table register to the kernel-only table.
    pub unsafe fn switch(&self) {
        // SAFETY: the table stays alive for the kernel's lifetime.
        unsafe { arch::switch_kernel(arch::v2p(self.page_table.as_usize())) };
    }
}

/// A process's address space: page table plus the size of the user part.
///
/// # Safety
///
/// The user part maps [0, pgroundup(size)) contiguously, each leaf frame
/// owned by this table and obtained from the allocator; above `KERNBASE`
/// only the shared kernel entries appear.
pub struct UserMemory {
    page_table: PageTable<UVAddr>,
    size: usize,
}

impl UserMemory {
    /// Create a user address space holding only the kernel mappings and,
    /// if `src_opt` is `Some(src)`, one zeroed page at address 0 loaded
    /// with `src` (the first process's program; must fit in a page).
    pub fn new(src_opt: Option<&[u8]>, allocator: &Spinlock<Kmem>) -> Option<Self> {
        let page_table = PageTable::new(allocator)?;
        let mut mem = scopeguard::guard(
            Self {
                page_table,
                size: 0,
            },
            |m| m.free(allocator),
        );
        mem.page_table.install_kmap(allocator).ok()?;

        if let Some(src) = src_opt {
            assert!(src.len() < PGSIZE, "UserMemory::new: more than a page");
            let mut page = allocator.alloc()?;
            page.write_bytes(0);
            page[..src.len()].copy_from_slice(src);
            mem.push_page(page, PteFlags::W | PteFlags::U, allocator)
                .map_err(|page| allocator.free(page))
                .ok()?;
        }

        Some(scopeguard::ScopeGuard::into_inner(mem))
    }

    /// Deep copy for fork: a new table with the kernel part plus freshly
    /// allocated frames holding byte-for-byte copies of the user part.
    pub fn clone(&mut self, allocator: &Spinlock<Kmem>) -> Option<Self> {
        let new = Self::new(None, allocator)?;
        let mut new = scopeguard::guard(new, |new| new.free(allocator));
        for va in num_iter::range_step(0, self.size, PGSIZE) {
            let pte = self
                .page_table
                .get_mut(UVAddr::from(va), false, allocator)
                .expect("clone: pte should exist");
            assert!(pte.is_present(), "clone: page not present");
            let pa = pte.get_pa().into_usize();
            let flags = pte.get_flags();
            let mut page = allocator.alloc()?;
            // SAFETY: pa maps a user frame of this address space, so the
            // kernel view of it is a valid page (type invariant).
            let src = unsafe { slice::from_raw_parts(arch::p2v(pa) as *const u8, PGSIZE) };
            page.copy_from_slice(src);
            new.push_page(page, flags, allocator)
                .map_err(|page| allocator.free(page))
                .ok()?;
        }
        let mut new = scopeguard::ScopeGuard::into_inner(new);
        new.size = self.size;
        Some(new)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical address of the page directory, for the hardware register.
    pub fn pgdir_pa(&self) -> usize {
        arch::v2p(self.page_table.as_usize())
    }

    /// Load a program segment: copy `sz` bytes from the inode at `offset`
    /// into memory at `va`. `va` must be page-aligned and the pages from
    /// `va` to `va + sz` must already be mapped.
    pub fn load_file(
        &mut self,
        va: UVAddr,
        ip: &mut InodeGuard<'_, '_>,
        offset: u32,
        sz: u32,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        assert!(va.is_page_aligned(), "load_file: va must be page aligned");
        for i in num_iter::range_step(0, sz, PGSIZE as u32) {
            let dst = self
                .get_slice(UVAddr::from(va.into_usize() + i as usize), allocator)
                .expect("load_file: address should exist");
            let n = cmp::min((sz - i) as usize, PGSIZE);
            let bytes_read = ip.read_bytes_kernel(&mut dst[..n], offset + i);
            if bytes_read != n {
                return Err(());
            }
        }
        Ok(())
    }

    /// Grow the user part to `newsz`, which need not be page-aligned.
    /// On failure every page allocated here is undone and the size is back
    /// to where it started.
    pub fn alloc(&mut self, newsz: usize, allocator: &Spinlock<Kmem>) -> Result<usize, ()> {
        if newsz >= KERNBASE {
            return Err(());
        }
        if newsz <= self.size {
            return Ok(self.size);
        }

        let oldsz = self.size;
        let mut this = scopeguard::guard(self, |this| {
            let _ = this.dealloc(oldsz, allocator);
        });
        while pgroundup(this.size) < pgroundup(newsz) {
            let mut page = allocator.alloc().ok_or(())?;
            page.write_bytes(0);
            this.push_page(page, PteFlags::W | PteFlags::U, allocator)
                .map_err(|page| allocator.free(page))?;
        }
        let this = scopeguard::ScopeGuard::into_inner(this);
        this.size = newsz;
        Ok(newsz)
    }

    /// Shrink the user part to `newsz`, freeing the frames above it.
    /// Returns the new process size.
    pub fn dealloc(&mut self, newsz: usize, allocator: &Spinlock<Kmem>) -> usize {
        if self.size <= newsz {
            return self.size;
        }
        while pgroundup(newsz) < pgroundup(self.size) {
            if let Some(page) = self.pop_page(allocator) {
                allocator.free(page);
            }
        }
        self.size = newsz;
        newsz
    }

    /// Grow or shrink by `n` bytes; returns the old size.
    pub fn resize(&mut self, n: i32, allocator: &Spinlock<Kmem>) -> Result<usize, ()> {
        let size = self.size;
        match n.cmp(&0) {
            cmp::Ordering::Equal => {}
            cmp::Ordering::Greater => {
                let _ = self.alloc(size + n as usize, allocator)?;
            }
            cmp::Ordering::Less => {
                let _ = self.dealloc(size - (-n as usize), allocator);
            }
        }
        Ok(size)
    }

    /// Mark a page inaccessible from user mode; used by exec for the
    /// guard page beneath the user stack.
    pub fn clear(&mut self, va: UVAddr, allocator: &Spinlock<Kmem>) {
        self.page_table
            .get_mut(va, false, allocator)
            .expect("clear")
            .clear_user();
    }

    /// Copy from kernel to user: `src` to virtual address `dstva`.
    pub fn copy_out_bytes(
        &mut self,
        dstva: UVAddr,
        src: &[u8],
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let mut dst = dstva.into_usize();
        let mut len = src.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(dst);
            let poffset = dst - va;
            let page = self.get_slice(UVAddr::from(va), allocator).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, len);
            page[poffset..poffset + n].copy_from_slice(&src[offset..offset + n]);
            len -= n;
            offset += n;
            dst += n;
        }
        Ok(())
    }

    pub fn copy_out<T: AsBytes>(
        &mut self,
        dstva: UVAddr,
        src: &T,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        self.copy_out_bytes(dstva, src.as_bytes(), allocator)
    }

    /// Copy from user to kernel: virtual address `srcva` into `dst`.
    pub fn copy_in_bytes(
        &mut self,
        dst: &mut [u8],
        srcva: UVAddr,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let mut src = srcva.into_usize();
        let mut len = dst.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(UVAddr::from(va), allocator).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, len);
            dst[offset..offset + n].copy_from_slice(&page[poffset..poffset + n]);
            len -= n;
            offset += n;
            src += n;
        }
        Ok(())
    }

    pub fn copy_in<T: AsBytes + FromBytes>(
        &mut self,
        dst: &mut T,
        srcva: UVAddr,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        self.copy_in_bytes(dst.as_bytes_mut(), srcva, allocator)
    }

    /// Copy a NUL-terminated string from user space, including the NUL.
    /// Fails on an unmapped address or if no NUL appears within `dst`.
    pub fn copy_in_str(
        &mut self,
        dst: &mut [u8],
        srcva: UVAddr,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let mut src = srcva.into_usize();
        let mut offset = 0;
        let mut max = dst.len();
        while max > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(UVAddr::from(va), allocator).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, max);

            let from = &page[poffset..poffset + n];
            match from.iter().position(|c| *c == 0) {
                Some(i) => {
                    dst[offset..offset + i + 1].copy_from_slice(&from[..i + 1]);
                    return Ok(());
                }
                None => {
                    dst[offset..offset + n].copy_from_slice(from);
                    max -= n;
                    offset += n;
                    src += n;
                }
            }
        }
        Err(())
    }

    /// Free the user frames, then the page-table pages, then the handle.
    pub fn free(mut self, allocator: &Spinlock<Kmem>) {
        let _ = self.dealloc(0, allocator);
        self.page_table.free_walk(allocator);
    }

    /// The page containing `va`, as a kernel-reachable slice. Enforces
    /// present + user-accessible, the `uva2ka` check: a cleared (guard)
    /// page or a kernel mapping yields `None`.
    fn get_slice(&mut self, va: UVAddr, allocator: &Spinlock<Kmem>) -> Option<&mut [u8]> {
        if va.into_usize() >= KERNBASE {
            return None;
        }
        let pte = self.page_table.get_mut(va, false, allocator)?;
        if !pte.is_user() {
            return None;
        }
        let pa = pte.get_pa().into_usize();
        // SAFETY: pa is a frame owned by this address space (invariant).
        Some(unsafe { slice::from_raw_parts_mut(arch::p2v(pa) as *mut u8, PGSIZE) })
    }

    /// Append a page at the current top of the user part.
    fn push_page(
        &mut self,
        page: Page,
        perm: PteFlags,
        allocator: &Spinlock<Kmem>,
    ) -> Result<(), Page> {
        let pa = page.into_usize();
        let size = pgroundup(self.size);
        self.page_table
            .insert(
                UVAddr::from(size),
                PAddr::from(arch::v2p(pa)),
                perm,
                allocator,
            )
            // SAFETY: pa is the address of the page given to us.
            .map_err(|_| unsafe { Page::from_usize(pa) })?;
        self.size = size + PGSIZE;
        Ok(())
    }

    /// Unmap and return the most recently appended page.
    fn pop_page(&mut self, allocator: &Spinlock<Kmem>) -> Option<Page> {
        if self.size == 0 {
            return None;
        }
        self.size = pgroundup(self.size) - PGSIZE;
        let pa = self
            .page_table
            .remove(UVAddr::from(self.size), allocator)
            .expect("pop_page")
            .into_usize();
        // SAFETY: the frame belonged to this address space (invariant).
        Some(unsafe { Page::from_usize(arch::p2v(pa)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::fresh_kmem;

    #[test]
    fn initial_program_is_mapped_at_zero() {
        let kmem = fresh_kmem(64);
        let code = [0x68u8, 0x24, 0x00, 0x00, 0x00];
        let mut mem = UserMemory::new(Some(&code), kmem).unwrap();
        assert_eq!(mem.size(), PGSIZE);
        let mut back = [0u8; 5];
        mem.copy_in_bytes(&mut back, UVAddr::from(0), kmem).unwrap();
        assert_eq!(back, code);
        mem.free(kmem);
    }

    #[test]
    fn grow_write_read_shrink() {
        let kmem = fresh_kmem(64);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.alloc(3 * PGSIZE, kmem).unwrap();
        assert_eq!(mem.size(), 3 * PGSIZE);

        // Write across a page boundary.
        let data: Vec<u8> = (0..64u8).collect();
        let addr = UVAddr::from(PGSIZE - 32);
        mem.copy_out_bytes(addr, &data, kmem).unwrap();
        let mut back = [0u8; 64];
        mem.copy_in_bytes(&mut back, addr, kmem).unwrap();
        assert_eq!(&back[..], &data[..]);

        assert_eq!(mem.dealloc(PGSIZE, kmem), PGSIZE);
        assert!(mem
            .copy_in_bytes(&mut back, UVAddr::from(PGSIZE), kmem)
            .is_err());
        mem.free(kmem);
    }

    #[test]
    fn grow_failure_rolls_back() {
        let kmem = fresh_kmem(16);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.alloc(PGSIZE, kmem).unwrap();
        // Far more than the arena holds.
        assert!(mem.alloc(64 * PGSIZE, kmem).is_err());
        assert_eq!(mem.size(), PGSIZE);
        // The rollback returned the pages: a small grow works again.
        mem.alloc(2 * PGSIZE, kmem).unwrap();
        mem.free(kmem);
    }

    #[test]
    fn grow_beyond_kernel_base_fails() {
        let kmem = fresh_kmem(16);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        assert!(mem.alloc(KERNBASE + PGSIZE, kmem).is_err());
        mem.free(kmem);
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let kmem = fresh_kmem(64);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.alloc(2 * PGSIZE, kmem).unwrap();
        mem.copy_out_bytes(UVAddr::from(10), b"parent", kmem)
            .unwrap();

        let mut child = mem.clone(kmem).unwrap();
        mem.copy_out_bytes(UVAddr::from(10), b"mutate", kmem)
            .unwrap();

        let mut back = [0u8; 6];
        child.copy_in_bytes(&mut back, UVAddr::from(10), kmem).unwrap();
        assert_eq!(&back, b"parent");
        child.free(kmem);
        mem.free(kmem);
    }

    #[test]
    fn cleared_page_is_unreachable_from_user() {
        let kmem = fresh_kmem(64);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.alloc(2 * PGSIZE, kmem).unwrap();
        mem.clear(UVAddr::from(0), kmem);
        let mut b = [0u8; 1];
        assert!(mem.copy_in_bytes(&mut b, UVAddr::from(8), kmem).is_err());
        // The page above the guard is still fine.
        mem.copy_in_bytes(&mut b, UVAddr::from(PGSIZE + 8), kmem)
            .unwrap();
        mem.free(kmem);
    }

    #[test]
    fn copy_in_str_respects_bounds() {
        let kmem = fresh_kmem(64);
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.alloc(PGSIZE, kmem).unwrap();
        mem.copy_out_bytes(UVAddr::from(100), b"hello\0", kmem)
            .unwrap();

        let mut buf = [0u8; 16];
        mem.copy_in_str(&mut buf, UVAddr::from(100), kmem).unwrap();
        assert_eq!(&buf[..6], b"hello\0");

        // No NUL within a 3-byte window.
        let mut small = [0u8; 3];
        assert!(mem.copy_in_str(&mut small, UVAddr::from(100), kmem).is_err());
        mem.free(kmem);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn double_map_is_fatal() {
        let kmem = fresh_kmem(16);
        let mut pt = PageTable::<UVAddr>::new(kmem).unwrap();
        let pa = PAddr::from(arch::v2p(kmem.alloc().unwrap().into_usize()));
        pt.insert(UVAddr::from(0), pa, PteFlags::W | PteFlags::U, kmem)
            .unwrap();
        let _ = pt.insert(UVAddr::from(0), pa, PteFlags::W | PteFlags::U, kmem);
    }
}
