//! Support for file descriptors: the system-wide file table, reference
//! counted `RcFile` handles, and read/write over the three kinds of open
//! object (inode, device, pipe).

use core::cell::UnsafeCell;
use core::cmp;
use core::mem;

use crate::addr::UVAddr;
use crate::fs::{RcInode, Stat};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::AllocatedPipe;
use crate::proc::myproc;

pub struct File {
    pub typ: FileType,
    pub readable: bool,
    pub writable: bool,
}

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode<'static>,
        /// Read/write offset; shared between dup'd descriptors and
        /// accessed only while the inode lock is held.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode<'static>,
        major: u16,
    },
}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    const fn none() -> Self {
        Self::new(FileType::None, false, false)
    }

    /// Get metadata about this file.
    pub fn stat(&self) -> Result<Stat, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => Ok(ip.stat()),
            _ => Err(()),
        }
    }

    /// Read from the file into the caller's memory at `addr`.
    pub fn read(&self, addr: UVAddr, n: u32) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(addr, n as usize),
            FileType::Inode { ip, off } => {
                let mut p = myproc().ok_or(())?;
                let mut guard = ip.lock();
                // SAFETY: `off` is only accessed under the inode lock.
                let cur = unsafe { *off.get() };
                let memory = p.data().memory.as_mut().ok_or(())?;
                let r = guard.read_user(memory, addr, cur, n);
                if let Ok(v) = r {
                    // SAFETY: as above.
                    unsafe { *off.get() = cur.wrapping_add(v as u32) };
                }
                r
            }
            FileType::Device { major, .. } => {
                let read = kernel().devsw(*major).and_then(|d| d.read).ok_or(())?;
                // Bounce device bytes through a kernel buffer, chunk by
                // chunk, into the caller's address space.
                let mut p = myproc().ok_or(())?;
                let mut buf = [0u8; 128];
                let mut done = 0usize;
                while done < n as usize {
                    let want = cmp::min(buf.len(), n as usize - done);
                    let got = read(&mut buf[..want])?;
                    let memory = p.data().memory.as_mut().ok_or(())?;
                    memory.copy_out_bytes(addr + done, &buf[..got], kernel().kmem())?;
                    done += got;
                    if got < want {
                        break;
                    }
                }
                Ok(done)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write to the file from the caller's memory at `addr`.
    pub fn write(&self, addr: UVAddr, n: u32) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(addr, n as usize),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size: i-node, indirect block,
                // allocation blocks, and 2 blocks of slop for non-aligned
                // writes.
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE) as u32;
                let fs = ip.fs();
                let mut p = myproc().ok_or(())?;
                let mut done = 0u32;
                while done < n {
                    let chunk = cmp::min(n - done, max);
                    let tx = fs.begin_tx();
                    let mut guard = ip.lock();
                    // SAFETY: `off` is only accessed under the inode lock.
                    let cur = unsafe { *off.get() };
                    let memory = p.data().memory.as_mut().ok_or(())?;
                    let written =
                        guard.write_user(memory, addr + done as usize, cur, chunk, &tx)?;
                    // SAFETY: as above.
                    unsafe { *off.get() = cur.wrapping_add(written as u32) };
                    drop(guard);
                    drop(tx);
                    if written != chunk as usize {
                        // Error from write_user, e.g. a file too large.
                        return Err(());
                    }
                    done += chunk;
                }
                Ok(n as usize)
            }
            FileType::Device { major, .. } => {
                let write = kernel().devsw(*major).and_then(|d| d.write).ok_or(())?;
                let mut p = myproc().ok_or(())?;
                let mut buf = [0u8; 128];
                let mut done = 0usize;
                while done < n as usize {
                    let want = cmp::min(buf.len(), n as usize - done);
                    let memory = p.data().memory.as_mut().ok_or(())?;
                    memory.copy_in_bytes(&mut buf[..want], addr + done, kernel().kmem())?;
                    write(&buf[..want])?;
                    done += want;
                }
                Ok(done)
            }
            FileType::None => panic!("File::write"),
        }
    }
}

/// Major device number of the console.
pub const CONSOLE: u16 = 1;

/// Map major device number to device read/write functions; populated by
/// external drivers (the console) during boot.
#[derive(Clone, Copy, Default)]
pub struct Devsw {
    pub read: Option<fn(&mut [u8]) -> Result<usize, ()>>,
    pub write: Option<fn(&[u8]) -> Result<usize, ()>>,
}

pub struct Ftable {
    /// Per-slot reference counts.
    shared: Spinlock<[u32; NFILE]>,
    slots: [UnsafeCell<File>; NFILE],
}

// SAFETY: a slot's `File` is written only while its refcount is zero
// (alloc) or is being dropped from one to zero (close); in between it is
// read-only shared state.
unsafe impl Sync for Ftable {}

impl Ftable {
    pub const fn new() -> Self {
        Self {
            shared: Spinlock::new("ftable", [0; NFILE]),
            slots: [const { UnsafeCell::new(File::none()) }; NFILE],
        }
    }

    /// Allocate a file structure for `file`. A full table hands the file
    /// back so the caller can release what it carries.
    pub fn alloc(&self, file: File) -> Result<RcFile, File> {
        let mut shared = self.shared.lock();
        for idx in 0..NFILE {
            if shared[idx] == 0 {
                shared[idx] = 1;
                // SAFETY: refcount was zero, so no handle aliases the slot.
                unsafe { *self.slots[idx].get() = file };
                return Ok(RcFile { idx });
            }
        }
        Err(file)
    }
}

/// A counted reference to an open file. Clone is dup; drop closes, and
/// the last close releases the underlying pipe or inode.
pub struct RcFile {
    idx: usize,
}

impl core::ops::Deref for RcFile {
    type Target = File;

    fn deref(&self) -> &File {
        // SAFETY: the slot holds a valid File while any handle exists.
        unsafe { &*kernel().ftable().slots[self.idx].get() }
    }
}

impl Clone for RcFile {
    /// filedup.
    fn clone(&self) -> Self {
        let mut shared = kernel().ftable().shared.lock();
        assert!(shared[self.idx] >= 1, "filedup");
        shared[self.idx] += 1;
        Self { idx: self.idx }
    }
}

impl Drop for RcFile {
    /// fileclose: decrement the refcount, releasing the underlying
    /// object when it reaches zero.
    fn drop(&mut self) {
        let ftable = kernel().ftable();
        let mut shared = ftable.shared.lock();
        assert!(shared[self.idx] >= 1, "fileclose");
        shared[self.idx] -= 1;
        if shared[self.idx] > 0 {
            return;
        }

        // Last reference: empty the slot, then finish up without the
        // table lock (closing may sleep).
        // SAFETY: the refcount just hit zero; no other handle exists.
        let file = unsafe { mem::replace(&mut *ftable.slots[self.idx].get(), File::none()) };
        drop(shared);

        match file.typ {
            FileType::None => {}
            FileType::Pipe { pipe } => pipe.close(file.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let fs = ip.fs();
                let tx = fs.begin_tx();
                ip.put(&tx);
            }
        }
    }
}
