//! Block-device request queue.
//!
//! The core drives one block device through the narrow `BlockDevice`
//! contract: submit a command for the queue head, get a completion
//! interrupt later. `Disk` keeps the FIFO of buffers awaiting I/O under a
//! spinlock; the interrupt handler transfers data for the head request,
//! marks the buffer `{valid, not dirty}`, wakes its sleepers, and starts
//! the next request. A simulated device may instead complete a command
//! synchronously from `start`, in which case the same completion routine
//! runs inline and nobody sleeps.
//!
//! While a buffer sits in the queue the device owns its data; the
//! submitting process keeps the buffer's sleep-lock but only watches the
//! flags until they become `{valid, not dirty}`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arrayvec::ArrayVec;

use crate::bio::{Buf, BufData, B_DIRTY, B_VALID};
use crate::lock::Spinlock;
use crate::param::NBUF;
use crate::proc::WaitChannel;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiskCommand {
    Read,
    Write,
}

/// The disk-I/O contract the core consumes. Implemented outside the core
/// by the PIO driver on x86, and by `SimDisk` for hosted tests.
pub trait BlockDevice: Sync {
    /// Whether a device is actually present; checked once at attach.
    fn present(&self) -> bool;

    /// Issue `cmd` for the queue head. Writes take their data from `data`
    /// now. Returns true if the command completed synchronously (a
    /// simulated device); hardware returns false and raises a completion
    /// interrupt later.
    fn start(&self, cmd: DiskCommand, dev: u32, blockno: u32, data: &mut BufData) -> bool;

    /// Complete the head request: reads deposit their data into `data`.
    fn finish(&self, cmd: DiskCommand, dev: u32, blockno: u32, data: &mut BufData);
}

/// One queued transfer.
///
/// # Safety
///
/// The pointers refer into a `BufEntry` whose sleep-lock is held by the
/// submitting process for the lifetime of the request, so they stay valid
/// and the data is not touched by anyone but the queue until the flags
/// say the request is done.
struct Request {
    dev: u32,
    blockno: u32,
    cmd: DiskCommand,
    data: *mut BufData,
    flags: *const AtomicU32,
    chan: *const WaitChannel,
}

// SAFETY: see `Request`; ownership of the pointed-to buffer is handed to
// the queue while the request is in flight.
unsafe impl Send for Request {}

struct DiskQueue {
    requests: ArrayVec<Request, NBUF>,
}

/// Write-once slot for the attached device.
struct DeviceSlot {
    device: UnsafeCell<Option<&'static dyn BlockDevice>>,
    ready: AtomicBool,
}

// SAFETY: the slot is written once before `ready` is set, and read-only
// afterwards.
unsafe impl Sync for DeviceSlot {}

pub struct Disk {
    slot: DeviceSlot,
    queue: Spinlock<DiskQueue>,
}

impl Disk {
    pub const fn new() -> Self {
        Self {
            slot: DeviceSlot {
                device: UnsafeCell::new(None),
                ready: AtomicBool::new(false),
            },
            queue: Spinlock::new("disk queue", DiskQueue {
                requests: ArrayVec::new_const(),
            }),
        }
    }

    /// Attach the device. Called once during boot wiring, before any I/O.
    pub fn set_device(&self, device: &'static dyn BlockDevice) {
        assert!(device.present(), "Disk::set_device: device not present");
        assert!(!self.slot.ready.load(Ordering::Acquire), "Disk::set_device");
        // SAFETY: single write before `ready` is published.
        unsafe { *self.slot.device.get() = Some(device) };
        self.slot.ready.store(true, Ordering::Release);
    }

    fn device(&self) -> &'static dyn BlockDevice {
        assert!(
            self.slot.ready.load(Ordering::Acquire),
            "Disk::device: no block device"
        );
        // SAFETY: `ready` is set only after the slot was written.
        unsafe { (*self.slot.device.get()).unwrap() }
    }

    /// Synchronize a buffer with disk: write it if dirty, else read it.
    /// The caller holds the buffer's sleep-lock; on return the buffer is
    /// `{valid, not dirty}`.
    pub fn rw(&self, b: &mut Buf<'_>) {
        let flags = b.flags();
        assert!(
            flags & (B_VALID | B_DIRTY) != B_VALID,
            "Disk::rw: nothing to do"
        );
        let cmd = if flags & B_DIRTY != 0 {
            DiskCommand::Write
        } else {
            DiskCommand::Read
        };

        let entry = b.entry();
        let req = Request {
            dev: b.dev,
            blockno: b.blockno,
            cmd,
            data: entry.inner.get_mut_raw(),
            flags: &entry.flags,
            chan: &entry.disk_done,
        };

        let mut queue = self.queue.lock();
        queue.requests.push(req);
        if queue.requests.len() == 1 {
            self.start_head(&mut queue);
        }

        // Wait for the request to finish.
        while b.flags() & (B_VALID | B_DIRTY) != B_VALID {
            entry.disk_done.sleep(&mut queue);
        }
    }

    /// Issue the device command for the queue head. A synchronous
    /// completion runs the completion routine inline and moves on to the
    /// next request.
    fn start_head(&self, queue: &mut crate::lock::SpinlockGuard<'_, DiskQueue>) {
        let device = self.device();
        loop {
            let req = match queue.requests.first() {
                Some(req) => req,
                None => return,
            };
            // SAFETY: the queue owns the buffer data while the request is
            // in flight (see `Request`).
            let data = unsafe { &mut *req.data };
            if !device.start(req.cmd, req.dev, req.blockno, data) {
                return;
            }
            self.finish_head(queue);
        }
    }

    /// Completion for the queue head: transfer read data, publish
    /// `{valid, not dirty}`, wake sleepers, pop the request.
    fn finish_head(&self, queue: &mut crate::lock::SpinlockGuard<'_, DiskQueue>) {
        let req = queue.requests.remove(0);
        // SAFETY: as in start_head.
        let data = unsafe { &mut *req.data };
        self.device().finish(req.cmd, req.dev, req.blockno, data);
        // SAFETY: `flags` points into the pinned BufEntry.
        let flags = unsafe { &*req.flags };
        flags.store(
            (flags.load(Ordering::Acquire) | B_VALID) & !B_DIRTY,
            Ordering::Release,
        );
        // SAFETY: `chan` points into the pinned BufEntry.
        unsafe { (*req.chan).wakeup() };
    }

    /// Completion-interrupt entry, called by the external ISR.
    pub fn intr(&self) {
        let mut queue = self.queue.lock();
        if queue.requests.is_empty() {
            // Spurious interrupt.
            return;
        }
        self.finish_head(&mut queue);
        self.start_head(&mut queue);
    }
}
