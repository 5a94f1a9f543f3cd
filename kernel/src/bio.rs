//! Buffer cache.
//!
//! The buffer cache is a fixed pool of buf structures holding cached
//! copies of disk block contents. Caching disk blocks in memory reduces
//! the number of disk reads and also provides a synchronization point for
//! blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `bread`.
//! * After changing buffer data, call `bwrite` to write it to disk
//!   (file-system code must go through the log's `write` instead).
//! * Dropping the buffer releases it; do not keep buffers longer than
//!   necessary.
//!
//! The cache-wide spinlock protects which blocks are cached, their
//! positions in the LRU order, and the reference counts; each buffer's
//! sleep-lock protects its data. The LRU order is a doubly-linked list
//! threaded through pool indices: reclamation scans from the LRU tail and
//! skips buffers that are referenced or pinned dirty by the log.

use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::lock::{SleepLock, Spinlock};
use crate::param::{BSIZE, NBUF};
use crate::proc::WaitChannel;
use crate::vdev::Disk;

/// Buffer has been read from disk.
pub const B_VALID: u32 = 0x2;
/// Buffer must reach disk before its slot can be recycled.
pub const B_DIRTY: u32 = 0x4;

/// Index value meaning "no buffer".
const NIL: usize = NBUF;

// Data in a buffer may be reinterpreted as u32s (log header, bitmap,
// indirect blocks), so it must be 4-byte aligned.
#[repr(align(4))]
pub struct BufData {
    pub inner: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self { inner: [0; BSIZE] }
    }

    pub fn copy_from(&mut self, other: &BufData) {
        self.inner.copy_from_slice(&other.inner);
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub(crate) struct BufEntry {
    /// B_VALID | B_DIRTY. Atomic because the LRU scan reads it under the
    /// cache lock and the device-queue completion path writes it while the
    /// owning process sleeps holding the buffer's sleep-lock.
    pub(crate) flags: AtomicU32,

    /// Wait channel saying the device finished this buffer.
    pub(crate) disk_done: WaitChannel,

    /// The block contents, under the per-buffer sleep-lock.
    pub(crate) inner: SleepLock<BufData>,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            disk_done: WaitChannel::new(),
            inner: SleepLock::new("buffer", BufData::new()),
        }
    }
}

/// Identity and LRU bookkeeping; all fields guarded by the cache spinlock.
struct BufInfo {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

struct BcacheShared {
    info: [BufInfo; NBUF],
    /// Most recently used end.
    head: usize,
    /// Least recently used end.
    tail: usize,
}

impl BcacheShared {
    const fn new() -> Self {
        Self {
            info: [const {
                BufInfo {
                    dev: u32::MAX,
                    blockno: 0,
                    refcnt: 0,
                    prev: NIL,
                    next: NIL,
                }
            }; NBUF],
            head: NIL,
            tail: NIL,
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.info[i].prev, self.info[i].next);
        if prev != NIL {
            self.info[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.info[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, i: usize) {
        self.info[i].prev = NIL;
        self.info[i].next = self.head;
        if self.head != NIL {
            self.info[self.head].prev = i;
        } else {
            self.tail = i;
        }
        self.head = i;
    }
}

pub struct Bcache {
    shared: Spinlock<BcacheShared>,
    entries: [BufEntry; NBUF],
}

/// A locked buffer: the holder has exclusive use of the data until drop,
/// which releases the sleep-lock and moves the buffer toward reuse.
pub struct Buf<'s> {
    cache: &'s Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            shared: Spinlock::new("bcache", BcacheShared::new()),
            entries: [const { BufEntry::new() }; NBUF],
        }
    }

    /// Chain every buffer into the LRU list. Called once at startup.
    pub fn init(&self) {
        let mut shared = self.shared.lock();
        for i in 0..NBUF {
            shared.push_front(i);
        }
    }

    /// Return a locked buffer for (dev, blockno); its contents may not be
    /// valid yet.
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut shared = self.shared.lock();

        // Is the block already cached?
        let mut i = shared.head;
        while i != NIL {
            if shared.info[i].dev == dev && shared.info[i].blockno == blockno {
                shared.info[i].refcnt += 1;
                drop(shared);
                return self.make_buf(i, dev, blockno);
            }
            i = shared.info[i].next;
        }

        // Not cached; recycle the least recently used buffer that nobody
        // references and the log has not pinned dirty.
        let mut i = shared.tail;
        while i != NIL {
            if shared.info[i].refcnt == 0
                && self.entries[i].flags.load(Ordering::Acquire) & B_DIRTY == 0
            {
                shared.info[i].dev = dev;
                shared.info[i].blockno = blockno;
                shared.info[i].refcnt = 1;
                self.entries[i].flags.store(0, Ordering::Release);
                drop(shared);
                return self.make_buf(i, dev, blockno);
            }
            i = shared.info[i].prev;
        }

        // The working set exceeds NBUF: a deadlock in the making.
        panic!("bget: no buffers");
    }

    fn make_buf(&self, idx: usize, dev: u32, blockno: u32) -> Buf<'_> {
        // Acquiring the sleep-lock may block; the cache lock is already
        // released. The handle doubles as the lock guard.
        mem::forget(self.entries[idx].inner.lock());
        Buf {
            cache: self,
            idx,
            dev,
            blockno,
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn bread(&self, disk: &Disk, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if b.flags() & B_VALID == 0 {
            disk.rw(&mut b);
        }
        b
    }

    /// Write the buffer's contents to disk. Only the log calls this; all
    /// other file-system writes must go through `Tx::write`.
    pub fn bwrite(&self, disk: &Disk, b: &mut Buf<'_>) {
        b.set_dirty();
        disk.rw(b);
    }

    /// Reference count of the cached (dev, blockno), if cached. Test aid.
    #[cfg(test)]
    fn refcnt(&self, dev: u32, blockno: u32) -> Option<u32> {
        let shared = self.shared.lock();
        let mut i = shared.head;
        while i != NIL {
            if shared.info[i].dev == dev && shared.info[i].blockno == blockno {
                return Some(shared.info[i].refcnt);
            }
            i = shared.info[i].next;
        }
        None
    }
}

impl<'s> Buf<'s> {
    pub(crate) fn entry(&self) -> &'s BufEntry {
        &self.cache.entries[self.idx]
    }

    pub fn flags(&self) -> u32 {
        self.entry().flags.load(Ordering::Acquire)
    }

    /// Pin the buffer for a pending write: the LRU scan will not recycle
    /// it until the device completion path clears the flag.
    pub(crate) fn set_dirty(&self) {
        let flags = &self.entry().flags;
        flags.store(flags.load(Ordering::Acquire) | B_DIRTY, Ordering::Release);
    }

    pub fn data(&self) -> &BufData {
        // SAFETY: this handle holds the buffer's sleep-lock.
        unsafe { &*self.entry().inner.get_mut_raw() }
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        // SAFETY: this handle holds the sleep-lock and `&mut self` is
        // exclusive.
        unsafe { &mut *self.entry().inner.get_mut_raw() }
    }
}

impl Drop for Buf<'_> {
    /// brelse: release the sleep-lock; if this was the last reference,
    /// move the buffer to the MRU end of the list.
    fn drop(&mut self) {
        // SAFETY: the handle holds the sleep-lock (see make_buf).
        unsafe { self.entry().inner.unlock() };

        let mut shared = self.cache.shared.lock();
        shared.info[self.idx].refcnt -= 1;
        if shared.info[self.idx].refcnt == 0 {
            shared.unlink(self.idx);
            shared.push_front(self.idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::sim::SimDisk;
    use crate::param::FSSIZE;

    fn setup() -> (&'static Bcache, &'static Disk) {
        let device = SimDisk::leak_new(FSSIZE);
        let disk = Box::leak(Box::new(Disk::new()));
        disk.set_device(device);
        let cache = Box::leak(Box::new(Bcache::new()));
        cache.init();
        (cache, disk)
    }

    #[test]
    fn read_write_round_trip() {
        let (cache, disk) = setup();
        {
            let mut b = cache.bread(disk, 1, 7);
            b.data_mut().inner[0..4].copy_from_slice(b"vx6!");
            cache.bwrite(disk, &mut b);
        }
        let b = cache.bread(disk, 1, 7);
        assert_eq!(&b.data().inner[0..4], b"vx6!");
        assert_eq!(b.flags() & B_VALID, B_VALID);
        assert_eq!(b.flags() & B_DIRTY, 0);
    }

    #[test]
    fn one_buffer_per_block() {
        let (cache, disk) = setup();
        let b = cache.bread(disk, 1, 3);
        assert_eq!(cache.refcnt(1, 3), Some(1));
        // A second reference hits the same cache slot rather than a copy.
        drop(b);
        let b1 = cache.bread(disk, 1, 3);
        assert_eq!(cache.refcnt(1, 3), Some(1));
        drop(b1);
        assert_eq!(cache.refcnt(1, 3), Some(0));
    }

    #[test]
    fn lru_reclaims_oldest_clean_buffer() {
        let (cache, disk) = setup();
        // Touch NBUF distinct blocks; block 100 first, so it becomes LRU.
        for bn in 0..NBUF as u32 {
            let _ = cache.bread(disk, 1, 100 + bn);
        }
        // All buffers are now identified; one more read must evict the
        // least recently used (block 100).
        let _ = cache.bread(disk, 1, 500);
        assert_eq!(cache.refcnt(1, 100), None);
        assert!(cache.refcnt(1, 100 + 1).is_some());
    }

    #[test]
    fn dirty_buffer_is_not_reclaimed() {
        let (cache, disk) = setup();
        {
            // Make block 100 dirty (pinned) and oldest.
            let b = cache.bread(disk, 1, 100);
            b.set_dirty();
        }
        for bn in 1..NBUF as u32 {
            let _ = cache.bread(disk, 1, 100 + bn);
        }
        let _ = cache.bread(disk, 1, 500);
        // The pinned block survived; a clean one was evicted instead.
        assert!(cache.refcnt(1, 100).is_some());
        assert_eq!(cache.refcnt(1, 101), None);
    }
}
