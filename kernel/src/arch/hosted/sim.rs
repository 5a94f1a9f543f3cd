//! Simulated block device and disk-image builder for hosted unit tests.
//!
//! `SimDisk` implements the `BlockDevice` contract synchronously: `start`
//! performs the whole transfer and reports synchronous completion, so the
//! queue's completion routine runs inline and nothing ever sleeps on it.
//!
//! The write budget simulates power failure: once the budget reaches
//! zero, further sector writes are silently lost, exactly as if the
//! machine died mid-sequence. Crash tests snapshot the surviving image
//! and "reboot" a fresh `FileSystem` over it.
//!
//! `mkfs` builds the minimal initial image the out-of-scope mkfs tool
//! would: superblock, empty log, inode table with the root directory,
//! free bitmap, and the root's "."/".." entries.

use zerocopy::AsBytes;

use crate::bio::BufData;
use crate::fs::{
    Dinode, Dirent, Superblock, DINODE_SIZE, DIRENT_SIZE, IPB, NDIRECT, ROOTINO, T_DIR,
};
use crate::lock::Spinlock;
use crate::param::{BSIZE, FSSIZE, LOGSIZE};
use crate::vdev::{BlockDevice, DiskCommand};

pub struct SimDisk {
    state: Spinlock<SimState>,
}

struct SimState {
    blocks: Vec<[u8; BSIZE]>,
    /// `Some(n)`: the power fails after `n` more sector writes.
    writes_left: Option<usize>,
}

impl SimDisk {
    pub fn leak_new(nblocks: usize) -> &'static SimDisk {
        Self::leak_from_image(vec![[0u8; BSIZE]; nblocks])
    }

    /// A freshly formatted FSSIZE-block file system.
    pub fn leak_formatted() -> &'static SimDisk {
        Self::leak_from_image(mkfs(FSSIZE))
    }

    pub fn leak_from_image(blocks: Vec<[u8; BSIZE]>) -> &'static SimDisk {
        Box::leak(Box::new(SimDisk {
            state: Spinlock::new(
                "simdisk",
                SimState {
                    blocks,
                    writes_left: None,
                },
            ),
        }))
    }

    /// The on-disk image as it stands; what a reboot would find.
    pub fn snapshot(&self) -> Vec<[u8; BSIZE]> {
        self.state.lock().blocks.clone()
    }

    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.lock().writes_left = budget;
    }
}

impl BlockDevice for SimDisk {
    fn present(&self) -> bool {
        true
    }

    fn start(&self, cmd: DiskCommand, _dev: u32, blockno: u32, data: &mut BufData) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;
        let bno = blockno as usize;
        match cmd {
            DiskCommand::Read => {
                data.inner = state.blocks[bno];
            }
            DiskCommand::Write => match state.writes_left {
                Some(0) => {
                    // Power is gone; the write never reaches the platter.
                }
                Some(ref mut n) => {
                    *n -= 1;
                    state.blocks[bno] = data.inner;
                }
                None => {
                    state.blocks[bno] = data.inner;
                }
            },
        }
        // Everything completes synchronously.
        true
    }

    fn finish(&self, _cmd: DiskCommand, _dev: u32, _blockno: u32, _data: &mut BufData) {}
}

/// Number of inodes in a built image.
pub const NINODES: u32 = 200;

/// Build an initial file-system image: boot block, superblock, log,
/// inode table holding the root directory, free bitmap, data.
pub fn mkfs(size: usize) -> Vec<[u8; BSIZE]> {
    let nlog = LOGSIZE + 1;
    let ninodeblocks = (NINODES / IPB) as usize + 1;
    let nbitmap = size / (BSIZE * 8) + 1;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta + 1 < size, "mkfs: image too small");

    let sb = Superblock {
        size: size as u32,
        nblocks: (size - nmeta) as u32,
        ninodes: NINODES,
        nlog: nlog as u32,
        logstart: 2,
        inodestart: (2 + nlog) as u32,
        bmapstart: (2 + nlog + ninodeblocks) as u32,
    };

    let mut img = vec![[0u8; BSIZE]; size];
    img[1][..sb.as_bytes().len()].copy_from_slice(sb.as_bytes());

    // The root directory: inode ROOTINO, one data block with "." and "..".
    let rootblock = nmeta as u32;
    let mut din = Dinode {
        typ: T_DIR,
        major: 0,
        minor: 0,
        nlink: 1,
        size: (2 * DIRENT_SIZE) as u32,
        addrs: [0; NDIRECT + 1],
    };
    din.addrs[0] = rootblock;
    let iblk = sb.iblock(ROOTINO) as usize;
    let ioff = (ROOTINO % IPB) as usize * DINODE_SIZE;
    img[iblk][ioff..ioff + DINODE_SIZE].copy_from_slice(din.as_bytes());

    let mut dot = Dirent {
        inum: ROOTINO as u16,
        name: [0; 14],
    };
    dot.name[0] = b'.';
    img[rootblock as usize][..DIRENT_SIZE].copy_from_slice(dot.as_bytes());
    dot.name[1] = b'.';
    img[rootblock as usize][DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dot.as_bytes());

    // Mark the metadata blocks and the root's data block in use.
    for b in 0..=nmeta {
        let blk = sb.bblock(b as u32) as usize;
        img[blk][b / 8] |= 1 << (b % 8);
    }

    img
}
