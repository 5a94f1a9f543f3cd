use core::mem;

use zerocopy::{AsBytes, FromBytes};

use super::Dinode;
use crate::bio::BufData;
use crate::param::BSIZE;

/// Disk layout:
/// [ boot block | super block | log | inode blocks |
///                                          free bit map | data blocks ]
///
/// mkfs computes the super block and builds an initial file system. The
/// super block describes the disk layout:
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct Superblock {
    /// Size of file system image (blocks).
    pub size: u32,

    /// Number of data blocks.
    pub nblocks: u32,

    /// Number of inodes.
    pub ninodes: u32,

    /// Number of log blocks.
    pub nlog: u32,

    /// Block number of first log block.
    pub logstart: u32,

    /// Block number of first inode block.
    pub inodestart: u32,

    /// Block number of first free map block.
    pub bmapstart: u32,
}

/// Inodes per block.
pub const IPB: u32 = (BSIZE / mem::size_of::<Dinode>()) as u32;

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl Superblock {
    /// Decode the super block from the block-1 buffer.
    pub fn read(data: &BufData) -> Self {
        Self::read_from_prefix(&data.inner[..]).expect("Superblock::read")
    }

    /// Block containing inode i.
    pub const fn iblock(&self, i: u32) -> u32 {
        i / IPB + self.inodestart
    }

    /// Block of free map containing bit for block b.
    pub const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}
