//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk inode holds the
//! file's type, link count, size, and the block numbers of its content;
//! inodes sit in the inode-table region at a position fixed by their
//! number.
//!
//! The kernel keeps a table of in-memory inodes (`Itable`) as the
//! synchronization point for inodes used by multiple processes. An
//! in-memory inode adds bookkeeping that is not on disk: the reference
//! count and the `valid` flag.
//!
//! * Allocation: an inode is allocated if its on-disk type is non-zero.
//!   `FileSystem::ialloc` allocates; `RcInode::put` frees when both the
//!   reference and link counts have fallen to zero.
//! * Referencing: `FileSystem::iget` finds or creates a table entry and
//!   returns a handle (`RcInode`); cloning the handle is `idup`, and
//!   `put` drops the reference. An entry with no references is free for
//!   recycling. Handles must be `put` inside a transaction; an implicit
//!   drop is a bug and panics.
//! * Validity: the copied disk fields are only correct once a lock has
//!   loaded them (`valid`).
//! * Locking: `RcInode::lock` yields an `InodeGuard`, and only the guard
//!   exposes or mutates the inode's fields and content.
//!
//! The table spinlock protects identity (dev, inum) and reference counts;
//! each slot's sleep-lock protects everything else. `iget` does no disk
//! I/O, so path lookup can keep long-lived references and only lock
//! inodes briefly, which is also what makes the `.`/`..` cycle in path
//! walking deadlock-free: at most one inode is locked at a time.

use core::mem;

use zerocopy::{AsBytes, FromBytes};

use super::{
    FileName, FileSystem, Path, Stat, Tx, DIRSIZ, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
    T_DEV, T_DIR, T_FILE,
};
use crate::addr::UVAddr;
use crate::kernel::kernel;
use crate::lock::{SleepLock, Spinlock};
use crate::param::{BSIZE, NINODE, ROOTDEV};
use crate::vm::UserMemory;

/// Size of a directory entry.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// In-memory file type.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct Dinode {
    /// File type (T_DIR, T_FILE, T_DEV; 0 = free).
    pub typ: i16,

    /// Major device number (T_DEV only).
    pub major: i16,

    /// Minor device number (T_DEV only).
    pub minor: i16,

    /// Number of links to inode in file system.
    pub nlink: i16,

    /// Size of file (bytes).
    pub size: u32,

    /// Data block addresses: NDIRECT direct blocks, then one
    /// singly-indirect block.
    pub addrs: [u32; NDIRECT + 1],
}

/// Directory entry; inum 0 marks a free slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    /// Bytes of the stored name, up to the first NUL.
    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    /// Fill in the name, NUL-terminated when shorter than DIRSIZ.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }
}

/// Copy of the disk inode plus the `valid` flag; guarded by the slot's
/// sleep-lock.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub addr_direct: [u32; NDIRECT],
    pub addr_indirect: u32,
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addr_direct: [0; NDIRECT],
            addr_indirect: 0,
        }
    }
}

/// Identity of one table slot; guarded by the table spinlock.
struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

pub struct Itable {
    shared: Spinlock<[InodeMeta; NINODE]>,
    slots: [SleepLock<InodeInner>; NINODE],
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            shared: Spinlock::new(
                "itable",
                [const {
                    InodeMeta {
                        dev: 0,
                        inum: 0,
                        refcnt: 0,
                    }
                }; NINODE],
            ),
            slots: [const { SleepLock::new("inode", InodeInner::new()) }; NINODE],
        }
    }
}

/// A counted reference to an in-memory inode.
///
/// Must be released with `put` (inside a transaction, because releasing
/// the last reference to a linkless inode frees it on disk). Dropping a
/// handle is a leak and deliberately fatal.
pub struct RcInode<'s> {
    fs: &'s FileSystem,
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

impl<'s> Clone for RcInode<'s> {
    /// idup: bump the reference count.
    fn clone(&self) -> Self {
        let mut shared = self.fs.itable.shared.lock();
        shared[self.idx].refcnt += 1;
        Self {
            fs: self.fs,
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }
}

impl Drop for RcInode<'_> {
    fn drop(&mut self) {
        panic!("RcInode must be put, never dropped");
    }
}

/// A locked inode: holds the slot's sleep-lock, with the disk fields
/// loaded.
pub struct InodeGuard<'a, 's> {
    pub ip: &'a RcInode<'s>,
}

impl<'s> RcInode<'s> {
    pub fn fs(&self) -> &'s FileSystem {
        self.fs
    }

    /// Table slot this handle refers to; test instrumentation.
    #[cfg(test)]
    pub(crate) fn slot_index(&self) -> usize {
        self.idx
    }

    /// Lock the inode, reading it from disk if necessary.
    pub fn lock(&self) -> InodeGuard<'_, 's> {
        mem::forget(self.fs.itable.slots[self.idx].lock());
        let mut guard = InodeGuard { ip: self };
        if !guard.inner().valid {
            let sb = self.fs.superblock();
            let bp = self.fs.bread(self.dev, sb.iblock(self.inum));
            let off = (self.inum % IPB) as usize * DINODE_SIZE;
            let dip = Dinode::read_from_prefix(&bp.data().inner[off..]).expect("Inode::lock");
            drop(bp);

            let inner = guard.inner_mut();
            inner.typ = match dip.typ {
                T_DIR => InodeType::Dir,
                T_FILE => InodeType::File,
                T_DEV => InodeType::Device {
                    major: dip.major as u16,
                    minor: dip.minor as u16,
                },
                _ => InodeType::None,
            };
            inner.nlink = dip.nlink;
            inner.size = dip.size;
            inner.addr_direct.copy_from_slice(&dip.addrs[..NDIRECT]);
            inner.addr_indirect = dip.addrs[NDIRECT];
            inner.valid = true;
            assert_ne!(inner.typ, InodeType::None, "Inode::lock: no type");
        }
        guard
    }

    /// Copy stat information from the inode.
    pub fn stat(&self) -> Stat {
        let ip = self.lock();
        let inner = ip.inner();
        Stat {
            dev: self.dev as i32,
            ino: self.inum,
            typ: match inner.typ {
                InodeType::None => 0,
                InodeType::Dir => T_DIR,
                InodeType::File => T_FILE,
                InodeType::Device { .. } => T_DEV,
            },
            nlink: inner.nlink,
            size: inner.size,
        }
    }

    /// Drop a reference to an in-memory inode.
    ///
    /// If that was the last reference, the table entry can be recycled.
    /// If that was the last reference and the inode has no links to it,
    /// free the inode (and its content) on disk, which is why every
    /// `put` must happen inside a transaction.
    pub fn put(self, tx: &Tx<'_>) {
        let fs = self.fs;
        let idx = self.idx;

        let shared = fs.itable.shared.lock();
        // SAFETY: the table lock is held; `valid`/`nlink` are only read,
        // and if refcnt == 1 nobody else can hold or take the sleep-lock.
        let peek = unsafe { &*fs.itable.slots[idx].get_mut_raw() };
        if shared[idx].refcnt == 1 && peek.valid && peek.nlink == 0 {
            // The inode has no links and no other references: truncate
            // and free. The sleep-lock acquisition cannot block, and no
            // new reference can appear, because nlink == 0 means no
            // directory entry names this inum.
            drop(shared);

            let mut ip = self.lock();
            ip.itrunc(tx);
            ip.inner_mut().typ = InodeType::None;
            ip.update(tx);
            ip.inner_mut().valid = false;
            drop(ip);

            fs.itable.shared.lock()[idx].refcnt -= 1;
        } else {
            let mut shared = shared;
            shared[idx].refcnt -= 1;
        }
        mem::forget(self);
    }
}

impl<'a, 's> InodeGuard<'a, 's> {
    fn fs(&self) -> &'s FileSystem {
        self.ip.fs
    }

    fn slot(&self) -> &SleepLock<InodeInner> {
        &self.ip.fs.itable.slots[self.ip.idx]
    }

    pub fn inner(&self) -> &InodeInner {
        // SAFETY: this guard holds the slot's sleep-lock.
        unsafe { &*self.slot().get_mut_raw() }
    }

    pub fn inner_mut(&mut self) -> &mut InodeInner {
        // SAFETY: this guard holds the sleep-lock and `&mut self` is
        // exclusive.
        unsafe { &mut *self.slot().get_mut_raw() }
    }

    /// Copy a modified in-memory inode to disk (through the log). Must be
    /// called after every change to a field that lives on disk.
    pub fn update(&self, tx: &Tx<'_>) {
        let fs = self.fs();
        let sb = fs.superblock();
        let mut bp = fs.bread(self.ip.dev, sb.iblock(self.ip.inum));
        let off = (self.ip.inum % IPB) as usize * DINODE_SIZE;
        let mut dip = Dinode::read_from_prefix(&bp.data().inner[off..]).expect("Inode::update");

        let inner = self.inner();
        match inner.typ {
            InodeType::None => {
                dip.typ = 0;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::Dir => {
                dip.typ = T_DIR;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::File => {
                dip.typ = T_FILE;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::Device { major, minor } => {
                dip.typ = T_DEV;
                dip.major = major as i16;
                dip.minor = minor as i16;
            }
        }
        dip.nlink = inner.nlink;
        dip.size = inner.size;
        dip.addrs[..NDIRECT].copy_from_slice(&inner.addr_direct);
        dip.addrs[NDIRECT] = inner.addr_indirect;

        bp.data_mut().inner[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
        tx.write(bp);
    }

    /// Truncate the inode: discard its contents, freeing every data block
    /// back to the bitmap.
    pub fn itrunc(&mut self, tx: &Tx<'_>) {
        let dev = self.ip.dev;
        for i in 0..NDIRECT {
            let addr = self.inner().addr_direct[i];
            if addr != 0 {
                tx.bfree(dev, addr);
                self.inner_mut().addr_direct[i] = 0;
            }
        }

        let indirect = self.inner().addr_indirect;
        if indirect != 0 {
            let bp = self.fs().bread(dev, indirect);
            for i in 0..NINDIRECT {
                let addr =
                    u32::read_from_prefix(&bp.data().inner[i * 4..]).expect("itrunc");
                if addr != 0 {
                    tx.bfree(dev, addr);
                }
            }
            drop(bp);
            tx.bfree(dev, indirect);
            self.inner_mut().addr_indirect = 0;
        }

        self.inner_mut().size = 0;
        self.update(tx);
    }

    /// Return the disk block backing logical block `bn`, allocating
    /// through the transaction as needed.
    fn bmap_or_alloc(&mut self, bn: usize, tx: &Tx<'_>) -> u32 {
        self.bmap_internal(bn, Some(tx))
    }

    /// Return the disk block backing logical block `bn`; the block must
    /// already exist.
    fn bmap(&mut self, bn: usize) -> u32 {
        self.bmap_internal(bn, None)
    }

    fn bmap_internal(&mut self, bn: usize, tx_opt: Option<&Tx<'_>>) -> u32 {
        let dev = self.ip.dev;
        if bn < NDIRECT {
            let mut addr = self.inner().addr_direct[bn];
            if addr == 0 {
                addr = tx_opt.expect("bmap: unallocated block").balloc(dev);
                self.inner_mut().addr_direct[bn] = addr;
            }
            addr
        } else {
            let bn = bn - NDIRECT;
            assert!(bn < NINDIRECT, "bmap: out of range");

            let mut indirect = self.inner().addr_indirect;
            if indirect == 0 {
                indirect = tx_opt.expect("bmap: unallocated block").balloc(dev);
                self.inner_mut().addr_indirect = indirect;
            }

            let mut bp = self.fs().bread(dev, indirect);
            let mut addr =
                u32::read_from_prefix(&bp.data().inner[bn * 4..]).expect("bmap");
            if addr == 0 {
                let tx = tx_opt.expect("bmap: unallocated block");
                addr = tx.balloc(dev);
                bp.data_mut().inner[bn * 4..bn * 4 + 4].copy_from_slice(addr.as_bytes());
                tx.write(bp);
            }
            addr
        }
    }

    /// Read data from the inode.
    ///
    /// `f(off, src)` copies `src` to the interval starting at byte `off`
    /// of the destination the caller knows about, a kernel slice or a
    /// user address range, which is why the copy is a callback.
    fn read_internal<F: FnMut(u32, &[u8]) -> Result<(), ()>>(
        &mut self,
        mut off: u32,
        mut n: u32,
        mut f: F,
    ) -> Result<usize, ()> {
        let size = self.inner().size;
        if off > size || off.wrapping_add(n) < off {
            return Err(());
        }
        if off + n > size {
            n = size - off;
        }
        let mut tot: u32 = 0;
        while tot < n {
            let bn = self.bmap(off as usize / BSIZE);
            let bp = self.fs().bread(self.ip.dev, bn);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let res = f(tot, &bp.data().inner[begin..begin + m as usize]);
            drop(bp);
            res?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Copy the inode's content at `off` into `dst`; returns bytes read.
    pub fn read_bytes_kernel(&mut self, dst: &mut [u8], off: u32) -> usize {
        self.read_internal(off, dst.len() as u32, |off, src| {
            dst[off as usize..off as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
        .unwrap_or(0)
    }

    /// Copy a typed value out of the inode at `off`.
    pub fn read_kernel<T: AsBytes + FromBytes>(&mut self, dst: &mut T, off: u32) -> Result<(), ()> {
        let bytes = self.read_bytes_kernel(dst.as_bytes_mut(), off);
        if bytes == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Copy `n` bytes of content at `off` to user address `dst`.
    pub fn read_user(
        &mut self,
        mem: &mut UserMemory,
        dst: UVAddr,
        off: u32,
        n: u32,
    ) -> Result<usize, ()> {
        self.read_internal(off, n, |off, src| {
            mem.copy_out_bytes(dst + off as usize, src, kernel().kmem())
        })
    }

    /// Write data to the inode; the mirror image of `read_internal`.
    /// Extending writes grow the recorded size; the inode is written back
    /// through the log either way, because `bmap_or_alloc` may have
    /// updated the address array.
    fn write_internal<F: FnMut(u32, &mut [u8]) -> Result<(), ()>>(
        &mut self,
        mut off: u32,
        n: u32,
        mut f: F,
        tx: &Tx<'_>,
    ) -> Result<usize, ()> {
        if off > self.inner().size {
            return Err(());
        }
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }
        let mut tot: u32 = 0;
        while tot < n {
            let bn = self.bmap_or_alloc(off as usize / BSIZE, tx);
            let mut bp = self.fs().bread(self.ip.dev, bn);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            if f(tot, &mut bp.data_mut().inner[begin..begin + m as usize]).is_ok() {
                tx.write(bp);
            } else {
                drop(bp);
                break;
            }
            tot += m;
            off += m;
        }

        if off > self.inner().size {
            self.inner_mut().size = off;
        }
        self.update(tx);
        Ok(tot as usize)
    }

    /// Copy `src` into the inode's content at `off`.
    pub fn write_bytes_kernel(&mut self, src: &[u8], off: u32, tx: &Tx<'_>) -> Result<usize, ()> {
        self.write_internal(
            off,
            src.len() as u32,
            |off, dst| {
                dst.copy_from_slice(&src[off as usize..off as usize + dst.len()]);
                Ok(())
            },
            tx,
        )
    }

    /// Copy a typed value into the inode at `off`.
    pub fn write_kernel<T: AsBytes>(&mut self, src: &T, off: u32, tx: &Tx<'_>) -> Result<(), ()> {
        let bytes = self.write_bytes_kernel(src.as_bytes(), off, tx)?;
        if bytes == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Copy `n` bytes from user address `src` into the inode at `off`.
    pub fn write_user(
        &mut self,
        mem: &mut UserMemory,
        src: UVAddr,
        off: u32,
        n: u32,
        tx: &Tx<'_>,
    ) -> Result<usize, ()> {
        self.write_internal(
            off,
            n,
            |off, dst| mem.copy_in_bytes(dst, src + off as usize, kernel().kmem()),
            tx,
        )
    }

    /// Look for a directory entry by name; returns the entry's inode and
    /// the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode<'s>, u32), ()> {
        assert_eq!(self.inner().typ, InodeType::Dir, "dirlookup not DIR");

        let size = self.inner().size;
        for off in (0..size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_kernel(&mut de, off).expect("dirlookup read");
            if de.inum != 0 && de.name_bytes() == name.as_bytes() {
                return Ok((self.fs().iget(self.ip.dev, de.inum as u32), off));
            }
        }
        Err(())
    }

    /// Write a new directory entry (name, inum) into the directory.
    /// Refuses a name that is already present.
    pub fn dirlink(&mut self, name: &FileName, inum: u32, tx: &Tx<'_>) -> Result<(), ()> {
        if let Ok((ip, _)) = self.dirlookup(name) {
            ip.put(tx);
            return Err(());
        }

        // Look for an empty slot, or append at the end.
        let size = self.inner().size;
        let mut de = Dirent::default();
        let mut off = 0;
        while off < size {
            self.read_kernel(&mut de, off).expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        de.inum = inum as u16;
        de.set_name(name);
        self.write_kernel(&de, off, tx).expect("dirlink");
        Ok(())
    }

    /// Is the directory empty except for "." and ".." ?
    pub fn is_dir_empty(&mut self) -> bool {
        let size = self.inner().size;
        let mut de = Dirent::default();
        for off in (2 * DIRENT_SIZE as u32..size).step_by(DIRENT_SIZE) {
            self.read_kernel(&mut de, off).expect("is_dir_empty");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

impl Drop for InodeGuard<'_, '_> {
    /// iunlock.
    fn drop(&mut self) {
        // SAFETY: the guard holds the slot's sleep-lock (see lock()).
        unsafe { self.slot().unlock() };
    }
}

impl FileSystem {
    /// Find the inode with number `inum` on device `dev` and return its
    /// in-memory handle, without locking it or reading it from disk.
    pub fn iget(&self, dev: u32, inum: u32) -> RcInode<'_> {
        let mut shared = self.itable.shared.lock();

        // Is the inode already in the table?
        let mut empty = None;
        for (i, meta) in shared.iter_mut().enumerate() {
            if meta.refcnt > 0 && meta.dev == dev && meta.inum == inum {
                meta.refcnt += 1;
                return RcInode {
                    fs: self,
                    idx: i,
                    dev,
                    inum,
                };
            }
            if empty.is_none() && meta.refcnt == 0 {
                empty = Some(i);
            }
        }

        // Recycle an unreferenced slot.
        let idx = empty.expect("iget: no inodes");
        shared[idx].dev = dev;
        shared[idx].inum = inum;
        shared[idx].refcnt = 1;
        // SAFETY: refcnt was 0, so nobody holds or can take the slot's
        // sleep-lock until this reference is visible.
        unsafe { (*self.itable.slots[idx].get_mut_raw()).valid = false };
        RcInode {
            fs: self,
            idx,
            dev,
            inum,
        }
    }

    /// Allocate a fresh inode on device `dev` with the given type.
    pub fn ialloc(&self, dev: u32, typ: InodeType, tx: &Tx<'_>) -> RcInode<'_> {
        let sb = self.superblock();
        for inum in 1..sb.ninodes {
            let mut bp = self.bread(dev, sb.iblock(inum));
            let off = (inum % IPB) as usize * DINODE_SIZE;
            let dip = Dinode::read_from_prefix(&bp.data().inner[off..]).expect("ialloc");

            if dip.typ == 0 {
                // A free inode: claim and zero it.
                let mut dip = Dinode {
                    typ: 0,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 1],
                };
                match typ {
                    InodeType::None => {}
                    InodeType::Dir => dip.typ = T_DIR,
                    InodeType::File => dip.typ = T_FILE,
                    InodeType::Device { major, minor } => {
                        dip.typ = T_DEV;
                        dip.major = major as i16;
                        dip.minor = minor as i16;
                    }
                }
                bp.data_mut().inner[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
                // Mark it allocated on the disk.
                tx.write(bp);
                return self.iget(dev, inum);
            }
            drop(bp);
        }
        panic!("ialloc: no inodes");
    }

    pub fn root(&self) -> RcInode<'_> {
        self.iget(ROOTDEV, ROOTINO)
    }

    /// Resolve `path` to an inode.
    pub fn namei<'p>(&self, path: &'p Path, tx: &Tx<'_>) -> Result<RcInode<'_>, ()> {
        Ok(self.namex(path, false, tx)?.0)
    }

    /// Resolve `path` to its parent directory and final component.
    pub fn nameiparent<'p>(
        &self,
        path: &'p Path,
        tx: &Tx<'_>,
    ) -> Result<(RcInode<'_>, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true, tx)?;
        Ok((ip, name.ok_or(())?))
    }

    /// Walk `path` one component at a time, locking at most one inode at
    /// a time and releasing it before descending, which keeps cycles like
    /// `/a/b/../b` deadlock-free.
    fn namex<'p>(
        &self,
        mut path: &'p Path,
        parent: bool,
        tx: &Tx<'_>,
    ) -> Result<(RcInode<'_>, Option<&'p FileName>), ()> {
        let mut ptr = if path.is_absolute() {
            self.root()
        } else {
            crate::proc::current_cwd().ok_or(())?
        };

        while let Some((next_path, name)) = path.skipelem() {
            path = next_path;

            let mut ip = ptr.lock();
            if ip.inner().typ != InodeType::Dir {
                drop(ip);
                ptr.put(tx);
                return Err(());
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let next = ip.dirlookup(name);
            drop(ip);
            ptr.put(tx);
            ptr = next?.0;
        }
        if parent {
            ptr.put(tx);
            return Err(());
        }
        Ok((ptr, None))
    }
}
