//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls.
//! The logging system only commits when there are no FS system calls
//! active, so there is never any reasoning required about whether a
//! commit might write an uncommitted system call's updates to disk.
//!
//! A system call should bracket its updates with `begin_op`/`end_op`
//! (`FileSystem::begin_tx` and the `Tx` drop). Usually `begin_op` just
//! increments the count of in-progress FS system calls and returns; if it
//! thinks the log is close to running out, it sleeps until the last
//! outstanding `end_op` commits.
//!
//! The log is a physical re-do log of disk blocks. The on-disk format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//!
//! The header write with a non-zero count is the commit point; recovery
//! at boot replays any committed, uninstalled transaction and is
//! idempotent.

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::{FileSystem, Superblock};
use crate::bio::Buf;
use crate::lock::SleepableLock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: u32,

    /// In commit(), please wait.
    committing: bool,

    /// In-memory mirror of the header block: the block numbers to be
    /// written home at the next commit.
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// Contents of the on-disk header block.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    pub const fn new() -> Self {
        Self {
            dev: 0,
            start: 0,
            size: 0,
            outstanding: 0,
            committing: false,
            blocks: ArrayVec::new_const(),
        }
    }

    /// Learn the log's position from the superblock and run recovery.
    /// Called once during initialization, before any transaction.
    pub fn init(&mut self, dev: u32, sb: &Superblock, fs: &FileSystem) {
        // The region holds the header plus at most LOGSIZE body blocks.
        assert!(
            sb.nlog >= 2 && sb.nlog as usize <= LOGSIZE + 1,
            "Log::init: bad log size"
        );
        self.dev = dev;
        self.start = sb.logstart;
        self.size = sb.nlog;
        self.recover_from_log(fs);
    }

    /// Read the log header from disk into the in-memory header.
    fn read_head(&mut self, fs: &FileSystem) {
        let buf = fs.bread(self.dev, self.start);
        let lh = LogHeader::read_from_prefix(&buf.data().inner[..]).expect("read_head");
        self.blocks.clear();
        for b in &lh.block[..lh.n as usize] {
            self.blocks.push(*b);
        }
    }

    /// Write the in-memory header to disk. With a non-zero count this is
    /// the true point at which the current transaction commits; with a
    /// zero count it erases the log.
    fn write_head(&mut self, fs: &FileSystem) {
        let mut buf = fs.bread(self.dev, self.start);
        let mut lh = LogHeader::read_from_prefix(&buf.data().inner[..]).expect("write_head");
        lh.n = self.blocks.len() as u32;
        for (db, b) in izip!(&mut lh.block, &self.blocks) {
            *db = *b;
        }
        buf.data_mut().inner[..core::mem::size_of::<LogHeader>()].copy_from_slice(lh.as_bytes());
        fs.bwrite(&mut buf);
    }

    /// Copy committed blocks from the log body to their home locations.
    fn install_trans(&mut self, fs: &FileSystem) {
        for (tail, dst) in self.blocks.iter().enumerate() {
            let lbuf = fs.bread(self.dev, self.start + tail as u32 + 1);
            let mut dbuf = fs.bread(self.dev, *dst);
            dbuf.data_mut().copy_from(lbuf.data());
            // This write also clears the dirty pin log_write placed.
            fs.bwrite(&mut dbuf);
        }
    }

    /// Copy modified blocks from the cache into the log body.
    fn write_log(&mut self, fs: &FileSystem) {
        for (tail, src) in self.blocks.iter().enumerate() {
            let mut to = fs.bread(self.dev, self.start + tail as u32 + 1);
            let from = fs.bread(self.dev, *src);
            to.data_mut().copy_from(from.data());
            fs.bwrite(&mut to);
        }
    }

    fn commit(&mut self, fs: &FileSystem) {
        if !self.blocks.is_empty() {
            // Write modified blocks from cache to the log body.
            self.write_log(fs);

            // Write the header to disk -- the real commit.
            self.write_head(fs);

            // Now install writes to home locations.
            self.install_trans(fs);

            // Erase the transaction from the log.
            self.blocks.clear();
            self.write_head(fs);
        }
    }

    fn recover_from_log(&mut self, fs: &FileSystem) {
        self.read_head(fs);

        // If committed, copy from log to disk.
        self.install_trans(fs);

        // Clear the log.
        self.blocks.clear();
        self.write_head(fs);
    }

    #[cfg(test)]
    pub(crate) fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// Caller has modified b's data and is done with the buffer.
    /// Record the block number and pin the buffer dirty in the cache;
    /// `commit` will do the disk write.
    ///
    /// `Tx::write` replaces `bwrite`; a typical use is:
    ///   let mut bp = fs.bread(...);
    ///   modify bp.data_mut();
    ///   tx.write(bp);
    pub fn write(&mut self, b: Buf<'_>) {
        assert!(
            self.blocks.len() < LOGSIZE && (self.blocks.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "write outside of trans");

        // Absorption: a block already in the log needs no second slot.
        if !self.blocks.contains(&b.blockno) {
            self.blocks.push(b.blockno);
        }
        // Pin: the LRU scan will not reuse a dirty buffer, so the logged
        // data survives in the cache until commit writes it out.
        b.set_dirty();
    }
}

impl SleepableLock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.blocks.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self, fs: &FileSystem) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: committing");

        if guard.outstanding == 0 {
            // No transaction is in progress, and holding the lock keeps
            // new ones from starting; committing keeps them out once the
            // lock drops.
            guard.committing = true;

            // Commit without holding the lock, since sleeping with it
            // held is not allowed.
            guard.reacquire_after(||
                // SAFETY: `committing` excludes every other log access.
                unsafe { &mut *self.get_mut_raw() }.commit(fs));

            guard.committing = false;
        }

        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        guard.wakeup();
    }
}
