//! Pipes: in-kernel bounded byte channels.
//!
//! A pipe is a page-backed byte ring shared by one read-only and one
//! write-only file. `nread` and `nwrite` count bytes forever and are
//! compared modulo the capacity for indexing, so a full ring
//! (`nwrite - nread == PIPESIZE`) and an empty one (`nread == nwrite`)
//! stay distinguishable. All state sits under one spinlock per pipe;
//! readers and writers sleep on separate channels.

use core::ops::Deref;
use core::ptr::NonNull;

use crate::addr::UVAddr;
use crate::file::{File, FileType, RcFile};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::page::Page;
use crate::proc::{myproc, WaitChannel};

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// WaitChannel saying there are unread bytes in the ring.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying there is room to write.
    write_waitchannel: WaitChannel,
}

enum PipeError {
    WaitForIo,
    InvalidStatus,
    InvalidCopy(usize),
}

impl PipeInner {
    /// Try to write up to `n` bytes from user address `addr`. Stops early
    /// when the ring fills (Ok with the partial count); fails if the read
    /// end is closed or the writer was killed.
    fn try_write(&mut self, addr: UVAddr, n: usize) -> Result<usize, PipeError> {
        if !self.readopen || myproc().map_or(false, |p| p.killed()) {
            return Err(PipeError::InvalidStatus);
        }
        let mut p = myproc().ok_or(PipeError::InvalidStatus)?;
        for i in 0..n {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                return Ok(i);
            }
            let mut ch = [0u8];
            let memory = p.data().memory.as_mut().ok_or(PipeError::InvalidStatus)?;
            if memory
                .copy_in_bytes(&mut ch, addr + i, kernel().kmem())
                .is_err()
            {
                return Err(PipeError::InvalidCopy(i));
            }
            self.data[self.nwrite as usize % PIPESIZE] = ch[0];
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    /// Try to read up to `n` bytes into user address `addr`. An empty
    /// ring with a live writer asks the caller to wait.
    fn try_read(&mut self, addr: UVAddr, n: usize) -> Result<usize, PipeError> {
        if self.nread == self.nwrite && self.writeopen {
            if myproc().map_or(false, |p| p.killed()) {
                return Err(PipeError::InvalidStatus);
            }
            return Err(PipeError::WaitForIo);
        }

        let mut p = myproc().ok_or(PipeError::InvalidStatus)?;
        for i in 0..n {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            let ch = [self.data[self.nread as usize % PIPESIZE]];
            self.nread = self.nread.wrapping_add(1);
            let memory = p.data().memory.as_mut().ok_or(PipeError::InvalidStatus)?;
            if memory
                .copy_out_bytes(addr + i, &ch, kernel().kmem())
                .is_err()
            {
                return Ok(i);
            }
        }
        Ok(n)
    }
}

impl Pipe {
    /// Write `n` bytes from `addr`, sleeping whenever the ring is full.
    /// Returns the number written, or Err once the read end is closed or
    /// the caller is killed.
    pub fn write(&self, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(addr + written, n - written) {
                Ok(w) => {
                    written += w;
                    self.read_waitchannel.wakeup();
                    if written < n {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(PipeError::InvalidCopy(w)) => {
                    self.read_waitchannel.wakeup();
                    return Ok(written + w);
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Read up to `n` bytes into `addr`, sleeping while the ring is empty
    /// and the write end is open. Returns the number read (0 at EOF).
    pub fn read(&self, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(addr, n) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => {
                    self.read_waitchannel.sleep(&mut inner);
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Close one end; returns true when both ends are now closed and the
    /// pipe should be freed.
    fn close_end(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }
        !inner.readopen && !inner.writeopen
    }
}

/// An owning pointer to a page-backed `Pipe`.
///
/// # Safety
///
/// `ptr` refers to a `Pipe` living in a page from the allocator. One
/// read-only and one write-only file share the pipe; the open flags in
/// `PipeInner` record which ends still exist, so the backing page is
/// freed exactly once, when both ends have closed.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: the pipe's state is behind its spinlock.
unsafe impl Send for AllocatedPipe {}

impl Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Pipe {
        // SAFETY: `ptr` refers to a live Pipe (type invariant).
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Create a pipe and the pair of files over it: (read end, write end).
    pub fn alloc() -> Result<(RcFile, RcFile), ()> {
        let page = kernel().kmem().alloc().ok_or(())?;
        let page = scopeguard::guard(page, |page| kernel().kmem().free(page));
        let ptr = page.addr() as *mut Pipe;
        // SAFETY: a page is big and aligned enough for a Pipe, and
        // exclusively ours.
        unsafe {
            ptr.write(Pipe {
                inner: Spinlock::new(
                    "pipe",
                    PipeInner {
                        data: [0; PIPESIZE],
                        nread: 0,
                        nwrite: 0,
                        readopen: true,
                        writeopen: true,
                    },
                ),
                read_waitchannel: WaitChannel::new(),
                write_waitchannel: WaitChannel::new(),
            });
        }
        // SAFETY: just initialized, non-null.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        // Dropping a pipe-typed File on these failure paths is harmless:
        // the backing page is still owned by the guard above.
        let f0 = kernel()
            .ftable()
            .alloc(File::new(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr },
                },
                true,
                false,
            ))
            .map_err(drop)?;
        let f0 = scopeguard::guard(f0, |f0| drop(f0));
        let f1 = kernel()
            .ftable()
            .alloc(File::new(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr },
                },
                false,
                true,
            ))
            .map_err(drop)?;

        // The files own the pipe now; keep the page.
        let page = scopeguard::ScopeGuard::into_inner(page);
        core::mem::forget(page);
        Ok((scopeguard::ScopeGuard::into_inner(f0), f1))
    }

    /// Close this end; frees the backing page once both ends are closed.
    pub fn close(self, writable: bool) {
        if self.close_end(writable) {
            // SAFETY: both ends are closed, so no reference remains; the
            // page came from the allocator in alloc().
            kernel()
                .kmem()
                .free(unsafe { Page::from_usize(self.ptr.as_ptr() as usize) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support;
    use crate::proc::test_util::FakeProc;

    /// Addresses in the fake process's two-page user space.
    const WRITE_BUF: usize = 0;
    const READ_BUF: usize = 4096;

    fn put_user(p: &mut FakeProc, addr: usize, bytes: &[u8]) {
        let procs = kernel().procs();
        // SAFETY: the fake process is ours and not running.
        let data = unsafe { procs.pool()[p.idx].data_raw() };
        data.memory
            .as_mut()
            .unwrap()
            .copy_out_bytes(UVAddr::from(addr), bytes, kernel().kmem())
            .unwrap();
    }

    fn get_user(p: &mut FakeProc, addr: usize, len: usize) -> Vec<u8> {
        let procs = kernel().procs();
        // SAFETY: as above.
        let data = unsafe { procs.pool()[p.idx].data_raw() };
        let mut buf = vec![0u8; len];
        data.memory
            .as_mut()
            .unwrap()
            .copy_in_bytes(&mut buf, UVAddr::from(addr), kernel().kmem())
            .unwrap();
        buf
    }

    #[test]
    fn bytes_cross_the_ring_boundary_in_order() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(2);
        let (reader, writer) = AllocatedPipe::alloc().unwrap();

        // 513 bytes, one past the ring capacity, moved in two rounds so
        // nobody has to block.
        let payload: Vec<u8> = (0..513u32).map(|i| (i * 13) as u8).collect();
        put_user(&mut fp, WRITE_BUF, &payload);

        assert_eq!(writer.write(UVAddr::from(WRITE_BUF), 300), Ok(300));
        assert_eq!(reader.read(UVAddr::from(READ_BUF), 300), Ok(300));
        assert_eq!(writer.write(UVAddr::from(WRITE_BUF + 300), 213), Ok(213));
        assert_eq!(reader.read(UVAddr::from(READ_BUF + 300), 213), Ok(213));

        assert_eq!(get_user(&mut fp, READ_BUF, 513), payload);
        drop(reader);
        drop(writer);
    }

    #[test]
    fn partial_read_returns_what_is_there() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(2);
        let (reader, writer) = AllocatedPipe::alloc().unwrap();

        put_user(&mut fp, WRITE_BUF, b"abc");
        assert_eq!(writer.write(UVAddr::from(WRITE_BUF), 3), Ok(3));
        // Ask for more than is buffered.
        assert_eq!(reader.read(UVAddr::from(READ_BUF), 100), Ok(3));
        assert_eq!(get_user(&mut fp, READ_BUF, 3), b"abc");
        drop(reader);
        drop(writer);
    }

    #[test]
    fn write_fails_after_reader_closes() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(2);
        let (reader, writer) = AllocatedPipe::alloc().unwrap();
        drop(reader);

        put_user(&mut fp, WRITE_BUF, b"x");
        assert_eq!(writer.write(UVAddr::from(WRITE_BUF), 1), Err(()));
        drop(writer);
    }

    #[test]
    fn read_sees_eof_after_writer_closes() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(2);
        let (reader, writer) = AllocatedPipe::alloc().unwrap();

        put_user(&mut fp, WRITE_BUF, b"hi\n");
        assert_eq!(writer.write(UVAddr::from(WRITE_BUF), 3), Ok(3));
        drop(writer);

        // Buffered bytes are still readable, then EOF.
        assert_eq!(reader.read(UVAddr::from(READ_BUF), 100), Ok(3));
        assert_eq!(get_user(&mut fp, READ_BUF, 3), b"hi\n");
        assert_eq!(reader.read(UVAddr::from(READ_BUF), 100), Ok(0));
        drop(reader);
    }
}
