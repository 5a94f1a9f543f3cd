//! The file system: superblock, write-ahead log, inode layer, directory
//! entries, and path resolution, glued over the buffer cache and the
//! block-device queue.
//!
//! `FileSystem` owns every layer; a system call brackets its updates in a
//! transaction with `begin_tx`, whose `Tx` handle is the only way to
//! write blocks (through the log), allocate or free data blocks, and
//! release inode references.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::bio::{Bcache, Buf};
use crate::lock::SleepableLock;
use crate::param::BSIZE;
use crate::vdev::{BlockDevice, Disk};

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    Dinode, Dirent, InodeGuard, InodeInner, InodeType, Itable, RcInode, DINODE_SIZE, DIRENT_SIZE,
};
pub use log::Log;
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEV, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB, IPB};

/// Root i-number.
pub const ROOTINO: u32 = 1;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 12;

/// Block addresses in a singly-indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Maximum length of a file name.
pub const DIRSIZ: usize = 14;

/// Write-once holder for the decoded superblock.
struct SuperblockCell {
    cell: UnsafeCell<Superblock>,
    ready: AtomicBool,
}

// SAFETY: written once before `ready` is published, read-only after.
unsafe impl Sync for SuperblockCell {}

pub struct FileSystem {
    superblock: SuperblockCell,
    log: SleepableLock<Log>,
    pub(crate) bcache: Bcache,
    pub(crate) disk: Disk,
    itable: Itable,
}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            superblock: SuperblockCell {
                cell: UnsafeCell::new(Superblock {
                    size: 0,
                    nblocks: 0,
                    ninodes: 0,
                    nlog: 0,
                    logstart: 0,
                    inodestart: 0,
                    bmapstart: 0,
                }),
                ready: AtomicBool::new(false),
            },
            log: SleepableLock::new("log", Log::new()),
            bcache: Bcache::new(),
            disk: Disk::new(),
            itable: Itable::new(),
        }
    }

    /// Attach the block device, read the superblock, and initialize the
    /// log, including crash recovery, unconditionally. Runs once,
    /// single-threaded, before the first transaction.
    pub fn init(&self, device: &'static dyn BlockDevice, dev: u32) {
        self.disk.set_device(device);
        self.bcache.init();

        let sb = {
            let bp = self.bread(dev, 1);
            Superblock::read(bp.data())
        };
        assert!(!self.superblock.ready.load(Ordering::Acquire), "fs::init");
        // SAFETY: single write before `ready` is published.
        unsafe { *self.superblock.cell.get() = sb };
        self.superblock.ready.store(true, Ordering::Release);

        // SAFETY: initialization is single-threaded; no transaction can
        // be running yet.
        let log = unsafe { &mut *self.log.get_mut_raw() };
        log.init(dev, self.superblock(), self);
    }

    pub fn superblock(&self) -> &Superblock {
        assert!(
            self.superblock.ready.load(Ordering::Acquire),
            "superblock read before fs::init"
        );
        // SAFETY: `ready` is set only after the cell was written.
        unsafe { &*self.superblock.cell.get() }
    }

    /// Return a locked, valid buffer for a block.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        self.bcache.bread(&self.disk, dev, blockno)
    }

    /// Synchronous block write; the log's transport, not for general use.
    pub(crate) fn bwrite(&self, b: &mut Buf<'_>) {
        self.bcache.bwrite(&self.disk, b);
    }

    /// Open a file-system transaction (begin_op). The returned handle's
    /// drop is end_op, which commits once no syscall is left inside a
    /// transaction.
    pub fn begin_tx(&self) -> Tx<'_> {
        self.log.begin_op();
        Tx { fs: self }
    }

    /// Completion-interrupt entry for the attached device's ISR.
    pub fn disk_intr(&self) {
        self.disk.intr();
    }

    /// Number of blocks the log currently holds; test instrumentation.
    #[cfg(test)]
    pub(crate) fn log_len(&self) -> usize {
        self.log.lock().blocks_len()
    }
}

/// An open transaction. All writes inside go through `write` (the log);
/// dropping the handle is end_op.
pub struct Tx<'s> {
    fs: &'s FileSystem,
}

impl<'s> Tx<'s> {
    pub fn fs(&self) -> &'s FileSystem {
        self.fs
    }

    /// log_write: record the buffer's block in the transaction and pin it
    /// in the cache until commit.
    pub fn write(&self, b: Buf<'_>) {
        self.fs.log.lock().write(b);
    }

    /// Allocate a zeroed data block on `dev` via the free bitmap.
    pub fn balloc(&self, dev: u32) -> u32 {
        let sb = self.fs.superblock();
        for base in num_iter::range_step(0, sb.size, BPB) {
            let mut bp = self.fs.bread(dev, sb.bblock(base));
            let mut bi = 0;
            while bi < BPB && base + bi < sb.size {
                let byte = (bi / 8) as usize;
                let mask = 1u8 << (bi % 8);
                if bp.data().inner[byte] & mask == 0 {
                    // Mark the block in use.
                    bp.data_mut().inner[byte] |= mask;
                    self.write(bp);
                    // Hand out zeroed blocks, through the log.
                    let mut zp = self.fs.bread(dev, base + bi);
                    zp.data_mut().inner.fill(0);
                    self.write(zp);
                    return base + bi;
                }
                bi += 1;
            }
            drop(bp);
        }
        panic!("balloc: out of blocks");
    }

    /// Return a data block to the free bitmap.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock();
        let mut bp = self.fs.bread(dev, sb.bblock(b));
        let bi = b % BPB;
        let byte = (bi / 8) as usize;
        let mask = 1u8 << (bi % 8);
        assert!(bp.data().inner[byte] & mask != 0, "freeing free block");
        bp.data_mut().inner[byte] &= !mask;
        self.write(bp);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.fs.log.end_op(self.fs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::sim::SimDisk;
    use crate::kernel::test_support::make_file;
    use crate::param::{FSSIZE, ROOTDEV};
    use crate::syscall::{create, do_link, do_unlink};

    fn path(s: &str) -> &Path {
        // SAFETY: test literals contain no NUL.
        unsafe { Path::from_bytes(s.as_bytes()) }
    }

    fn fresh_fs() -> (&'static FileSystem, &'static SimDisk) {
        let device = SimDisk::leak_formatted();
        let fs: &'static FileSystem = Box::leak(Box::new(FileSystem::new()));
        fs.init(device, ROOTDEV);
        (fs, device)
    }

    fn boot_over(image: Vec<[u8; crate::param::BSIZE]>) -> (&'static FileSystem, &'static SimDisk) {
        let device = SimDisk::leak_from_image(image);
        let fs: &'static FileSystem = Box::leak(Box::new(FileSystem::new()));
        fs.init(device, ROOTDEV);
        (fs, device)
    }

    fn read_all(fs: &FileSystem, p: &str) -> Result<Vec<u8>, ()> {
        let tx = fs.begin_tx();
        let ip = fs.namei(path(p), &tx)?;
        let mut guard = ip.lock();
        let size = guard.inner().size as usize;
        let mut buf = vec![0u8; size];
        let n = guard.read_bytes_kernel(&mut buf, 0);
        assert_eq!(n, size);
        drop(guard);
        ip.put(&tx);
        Ok(buf)
    }

    fn nlink_of(fs: &FileSystem, p: &str) -> i16 {
        let tx = fs.begin_tx();
        let ip = fs.namei(path(p), &tx).expect("nlink_of");
        let st = ip.stat();
        ip.put(&tx);
        st.nlink
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn write_then_read_round_trip() {
        let (fs, _) = fresh_fs();
        let data = pattern(5000);
        make_file(fs, "/a", &data);
        assert_eq!(read_all(fs, "/a").unwrap(), data);
    }

    #[test]
    fn write_crosses_direct_indirect_boundary() {
        let (fs, _) = fresh_fs();
        // NDIRECT direct blocks cover 6144 bytes; go well past that.
        let data = pattern(NDIRECT * BSIZE + 3 * BSIZE / 2);
        make_file(fs, "/big", &data);
        let back = read_all(fs, "/big").unwrap();
        assert_eq!(back.len(), data.len());
        let boundary = NDIRECT * BSIZE;
        assert_eq!(&back[boundary - 16..boundary + 16], &data[boundary - 16..boundary + 16]);
        assert_eq!(back, data);
    }

    #[test]
    fn file_cannot_outgrow_maxfile() {
        let (fs, _) = fresh_fs();
        let last = pattern(1024);
        // Fill the file to its absolute limit.
        let tx = fs.begin_tx();
        let ip = create(fs, path("/limit"), InodeType::File, &tx).unwrap();
        drop(tx);
        let total = (MAXFILE * BSIZE) as u32;
        let mut off = 0u32;
        while off < total {
            let tx = fs.begin_tx();
            let mut guard = ip.lock();
            guard.write_bytes_kernel(&last, off, &tx).unwrap();
            drop(guard);
            drop(tx);
            off += last.len() as u32;
        }

        // One byte more must fail, leaving the prior bytes intact.
        let tx = fs.begin_tx();
        let mut guard = ip.lock();
        assert_eq!(guard.inner().size, total);
        assert!(guard.write_bytes_kernel(b"x", total, &tx).is_err());
        let mut tail = [0u8; 16];
        assert_eq!(guard.read_bytes_kernel(&mut tail, total - 16), 16);
        assert_eq!(&tail, &last[last.len() - 16..]);
        drop(guard);
        ip.put(&tx);
        drop(tx);
    }

    #[test]
    fn link_then_unlink_old_keeps_content() {
        let (fs, _) = fresh_fs();
        let data = pattern(800);
        make_file(fs, "/a", &data);

        do_link(fs, path("/a"), path("/b")).unwrap();
        assert_eq!(nlink_of(fs, "/a"), 2);
        let (ia, ib) = {
            let tx = fs.begin_tx();
            let a = fs.namei(path("/a"), &tx).unwrap();
            let b = fs.namei(path("/b"), &tx).unwrap();
            let pair = (a.inum, b.inum);
            a.put(&tx);
            b.put(&tx);
            pair
        };
        assert_eq!(ia, ib);

        do_unlink(fs, path("/a")).unwrap();
        assert!(read_all(fs, "/a").is_err());
        assert_eq!(read_all(fs, "/b").unwrap(), data);
        assert_eq!(nlink_of(fs, "/b"), 1);
    }

    #[test]
    fn link_to_directory_fails() {
        let (fs, _) = fresh_fs();
        let tx = fs.begin_tx();
        let d = create(fs, path("/d"), InodeType::Dir, &tx).unwrap();
        d.put(&tx);
        drop(tx);
        assert!(do_link(fs, path("/d"), path("/d2")).is_err());
    }

    #[test]
    fn unlink_nonempty_directory_fails() {
        let (fs, _) = fresh_fs();
        let tx = fs.begin_tx();
        let d = create(fs, path("/dir"), InodeType::Dir, &tx).unwrap();
        d.put(&tx);
        drop(tx);
        assert_eq!(nlink_of(fs, "/"), 2); // root gained a ".."
        make_file(fs, "/dir/f", b"payload");

        assert!(do_unlink(fs, path("/dir")).is_err());
        assert_eq!(read_all(fs, "/dir/f").unwrap(), b"payload");

        do_unlink(fs, path("/dir/f")).unwrap();
        do_unlink(fs, path("/dir")).unwrap();
        assert!(read_all(fs, "/dir").is_err());
        assert_eq!(nlink_of(fs, "/"), 1);
    }

    #[test]
    fn unlink_dot_fails() {
        let (fs, _) = fresh_fs();
        assert!(do_unlink(fs, path("/.")).is_err());
        assert!(do_unlink(fs, path("/..")).is_err());
    }

    #[test]
    fn unlinked_file_blocks_return_to_bitmap() {
        let (fs, _) = fresh_fs();
        make_file(fs, "/grows", &pattern(20 * BSIZE));

        // Freeing the file hands every block back: allocating afterwards
        // reuses the same first block the file got.
        let tx = fs.begin_tx();
        let first = {
            let ip = fs.namei(path("/grows"), &tx).unwrap();
            let guard = ip.lock();
            let b = guard.inner().addr_direct[0];
            drop(guard);
            ip.put(&tx);
            b
        };
        drop(tx);

        do_unlink(fs, path("/grows")).unwrap();

        let tx = fs.begin_tx();
        let reused = tx.balloc(ROOTDEV);
        assert_eq!(reused, first);
        tx.bfree(ROOTDEV, reused);
        drop(tx);
    }

    #[test]
    fn balloc_hands_out_zeroed_blocks() {
        let (fs, _) = fresh_fs();
        let tx = fs.begin_tx();
        let b = tx.balloc(ROOTDEV);
        {
            let bp = fs.bread(ROOTDEV, b);
            assert!(bp.data().inner.iter().all(|&x| x == 0));
        }
        // Dirty the block, free it, reallocate: zeroed again.
        {
            let mut bp = fs.bread(ROOTDEV, b);
            bp.data_mut().inner.fill(0xAB);
            tx.write(bp);
        }
        tx.bfree(ROOTDEV, b);
        let again = tx.balloc(ROOTDEV);
        assert_eq!(again, b);
        {
            let bp = fs.bread(ROOTDEV, again);
            assert!(bp.data().inner.iter().all(|&x| x == 0));
        }
        tx.bfree(ROOTDEV, again);
        drop(tx);
    }

    #[test]
    fn one_in_memory_inode_per_disk_inode() {
        let (fs, _) = fresh_fs();
        let tx = fs.begin_tx();
        let a = fs.iget(ROOTDEV, ROOTINO);
        let b = fs.iget(ROOTDEV, ROOTINO);
        assert_eq!(a.slot_index(), b.slot_index());
        a.put(&tx);
        b.put(&tx);
        drop(tx);
    }

    #[test]
    fn crash_before_commit_point_discards_everything() {
        let (fs, device) = fresh_fs();
        let before = device.snapshot();

        // Power dies before any commit write lands.
        device.set_write_budget(Some(0));
        {
            let tx = fs.begin_tx();
            let ip = create(fs, path("/a"), InodeType::File, &tx).unwrap();
            let mut guard = ip.lock();
            guard.write_bytes_kernel(&pattern(5000), 0, &tx).unwrap();
            drop(guard);
            ip.put(&tx);
            drop(tx); // commit runs, but nothing reaches the platter
        }

        // The surviving image is exactly the pre-transaction image.
        let after = device.snapshot();
        assert_eq!(after, before);

        // Reboot: recovery finds an empty log; /a never happened.
        let (fs2, _) = boot_over(after);
        assert!(read_all(fs2, "/a").is_err());
    }

    #[test]
    fn crash_after_commit_point_preserves_transaction() {
        let (fs, device) = fresh_fs();
        let data = pattern(5000);

        let tx = fs.begin_tx();
        let ip = create(fs, path("/a"), InodeType::File, &tx).unwrap();
        let mut guard = ip.lock();
        guard.write_bytes_kernel(&data, 0, &tx).unwrap();
        drop(guard);
        ip.put(&tx);
        // The log body plus the header write make it out; the install
        // writes do not.
        let logged = fs.log_len();
        assert!(logged > 0);
        device.set_write_budget(Some(logged + 1));
        drop(tx);

        // Reboot: the committed transaction must be replayed in full.
        let (fs2, _) = boot_over(device.snapshot());
        assert_eq!(read_all(fs2, "/a").unwrap(), data);
    }

    #[test]
    fn recovery_is_idempotent() {
        let (fs, device) = fresh_fs();
        let data = pattern(3000);

        let tx = fs.begin_tx();
        let ip = create(fs, path("/r"), InodeType::File, &tx).unwrap();
        let mut guard = ip.lock();
        guard.write_bytes_kernel(&data, 0, &tx).unwrap();
        drop(guard);
        ip.put(&tx);
        let logged = fs.log_len();
        device.set_write_budget(Some(logged + 1));
        drop(tx);

        // First reboot replays the log.
        let crashed = device.snapshot();
        let (_fs2, device2) = boot_over(crashed);
        let once = device2.snapshot();

        // Recovering the recovered image changes nothing.
        let (fs3, device3) = boot_over(once.clone());
        assert_eq!(device3.snapshot(), once);
        assert_eq!(read_all(fs3, "/r").unwrap(), data);
    }
}
