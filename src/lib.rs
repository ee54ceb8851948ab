pub mod bitmap; // free-block bitmap
pub mod block_cache; // Cache for block devices
pub mod block_device;
mod common;
pub mod disk; // on-disk records
pub mod error;
pub mod fs; // file system
pub mod inode;
pub mod logger; // write-ahead log
pub mod sleep_lock;

pub use common::*;

pub use bitmap::BitMap;
pub use block_cache::{BlockCache, BlockGuard};
pub use block_device::{BlockDevice, FileDisk, MemDisk};
pub use disk::{DirEntry, DiskInode, FileKind, SuperBlock};
pub use error::FsError;
pub use fs::FileSystem;
pub use inode::{Inode, InodeGuard, InodeStat, InodeTable};
pub use logger::{LogManager, OpContext};
