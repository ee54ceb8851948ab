pub const ROOTINO: usize = 1; // root i-number

pub const FSMAGIC: u32 = 0x10203040;

/// block size
pub const BSIZE: usize = 512;

/// direct blocks in inode
pub const NDIRECT: usize = 8;

/// number of block numbers an indirect block holds
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();

/// max # of blocks a file can have
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// max # of bytes a file can have
pub const MAXFILE_BYTES: usize = MAXFILE * BSIZE;

/// encoded size of an on-disk inode
pub const DINODE_SIZE: usize = 4 * size_of::<u16>() + size_of::<u32>() + (NDIRECT + 1) * size_of::<u32>();

/// inodes per block
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// bitmap bits per block
pub const BPB: usize = BSIZE * 8;

/// Directory is a file containing a sequence of dirent structures.
pub const DIRSIZ: usize = 14;

/// encoded size of a directory entry
pub const DIRENT_SIZE: usize = size_of::<u16>() + DIRSIZ;

/// max # of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;

/// max data blocks in on-disk log
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// once the cache holds this many blocks, `acquire` tries to evict before
/// allocating a new entry
pub const EVICTION_THRESHOLD: usize = MAXOPBLOCKS * 3;

/// largest write `FileSystem::write_file` puts into one transaction:
/// inode block, indirect block and two bitmap blocks, plus data blocks that may
/// each need a fresh zeroed block
pub const MAXOPBYTES: usize = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
