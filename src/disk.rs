//! Disk layout:
//! [ boot block | super block | log_hdr + logs(LOGSIZE) | inode blocks | free bit map | data blocks ]
//!
//! Every record is encoded with bincode's fixed-width little-endian format.

use super::*;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SuperBlock {
    /// Must be FSMAGIC
    pub magic: u32,
    /// Size of file system image (blocks)
    pub size: u32,
    /// Number of data blocks
    pub nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks, header included
    pub nlog: u32,
    /// Block number of first log block
    pub logstart: u32,
    /// Block number of first inode block
    pub inodestart: u32,
    /// Block number of first free map block
    pub bmapstart: u32,
}

impl SuperBlock {
    /// block holding the bitmap bit of block `bno`
    pub fn bblock(&self, bno: usize) -> usize {
        self.bmapstart as usize + bno / BPB
    }

    /// block holding inode `ino`
    pub fn iblock(&self, ino: usize) -> usize {
        self.inodestart as usize + ino / IPB
    }

    pub fn data_start(&self) -> usize {
        (self.size - self.nblocks) as usize
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Invalid = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

impl TryFrom<u16> for FileKind {
    type Error = u16;

    fn try_from(raw: u16) -> Result<Self, u16> {
        match raw {
            0 => Ok(FileKind::Invalid),
            1 => Ok(FileKind::Directory),
            2 => Ok(FileKind::File),
            3 => Ok(FileKind::Device),
            other => Err(other),
        }
    }
}

// stored as its bare u16 tag, not as a bincode enum variant index
impl Serialize for FileKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(*self as u16)
    }
}

impl<'de> Deserialize<'de> for FileKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u16::deserialize(deserializer)?;
        FileKind::try_from(raw).map_err(|raw| D::Error::custom(format!("bad inode kind {raw}")))
    }
}

/// inode on disk
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiskInode {
    /// File type
    pub kind: FileKind,
    /// Major device number (Device only)
    pub major: u16,
    /// Minor device number (Device only)
    pub minor: u16,
    /// Number of links to inode in file system
    pub nlink: u16,
    /// Size of file (bytes)
    pub size: u32,
    /// Direct data block addresses
    pub addrs: [u32; NDIRECT],
    /// Address of the indirect block
    pub indirect: u32,
}

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirEntry {
    /// inode num, 0 marks a free slot
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    /// Names longer than DIRSIZ are cut, the way they are stored.
    pub fn new(name: &str, inum: u16) -> Self {
        let mut buf = [0u8; DIRSIZ];
        let bytes = name.as_bytes();
        let n = bytes.len().min(DIRSIZ);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { inum, name: buf }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        self.name_bytes() == &bytes[..bytes.len().min(DIRSIZ)]
    }

    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        encode_into(&mut buf, self);
        buf
    }
}

/// log header on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogHeader {
    pub n: u32,
    pub blocks: [u32; LOGSIZE], //  blockno
}

impl LogHeader {
    pub fn from_blocks(list: &[usize]) -> Self {
        assert!(list.len() <= LOGSIZE, "log header: {} blocks", list.len());
        let mut hdr = LogHeader {
            n: list.len() as u32,
            ..Default::default()
        };
        for (slot, &bno) in hdr.blocks.iter_mut().zip(list) {
            *slot = bno as u32;
        }
        hdr
    }

    pub fn to_blocks(&self) -> Vec<usize> {
        assert!(self.n as usize <= LOGSIZE, "log header: corrupt count {}", self.n);
        self.blocks[..self.n as usize].iter().map(|&b| b as usize).collect()
    }
}

/// Decode a record from the front of `bytes`. A record that cannot be decoded
/// means the image is corrupt.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    bincode::deserialize(bytes).unwrap_or_else(|e| panic!("decode: corrupt on-disk record: {e}"))
}

/// Encode a record into the front of `dst`.
pub fn encode_into<T: Serialize>(dst: &mut [u8], value: &T) {
    bincode::serialize_into(dst, value).unwrap_or_else(|e| panic!("encode: record does not fit: {e}"))
}

/// i-th block number stored in an indirect block
pub fn indirect_get(block: &[u8; BSIZE], i: usize) -> u32 {
    let off = i * size_of::<u32>();
    u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]])
}

pub fn indirect_set(block: &mut [u8; BSIZE], i: usize, bno: u32) {
    let off = i * size_of::<u32>();
    block[off..off + size_of::<u32>()].copy_from_slice(&bno.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_layout_constants() {
        assert_eq!(bincode::serialized_size(&DiskInode::default()).unwrap() as usize, DINODE_SIZE);
        assert_eq!(bincode::serialized_size(&DirEntry::default()).unwrap() as usize, DIRENT_SIZE);
        assert!(bincode::serialized_size(&LogHeader::default()).unwrap() as usize <= BSIZE);
        assert!(bincode::serialized_size(&SuperBlock::default()).unwrap() as usize <= BSIZE);
        assert!(IPB * DINODE_SIZE <= BSIZE);
    }

    #[test]
    fn inode_kind_is_stored_as_u16() {
        let dinode = DiskInode {
            kind: FileKind::Directory,
            nlink: 2,
            size: 32,
            ..Default::default()
        };
        let mut buf = [0u8; DINODE_SIZE];
        encode_into(&mut buf, &dinode);
        assert_eq!(&buf[..2], &[1, 0]);
        assert_eq!(decode::<DiskInode>(&buf), dinode);
    }

    #[test]
    #[should_panic(expected = "corrupt")]
    fn unknown_inode_kind_is_corruption() {
        let buf = [9u8; DINODE_SIZE];
        let _: DiskInode = decode(&buf);
    }

    #[test]
    fn dirent_names_truncate_to_dirsiz() {
        let de = DirEntry::new("a-very-long-file-name", 3);
        assert_eq!(de.name(), "a-very-long-fi");
        assert!(de.matches("a-very-long-file-name"));
        assert!(de.matches("a-very-long-fi"));
        assert!(!de.matches("a-very-long"));
        let de = DirEntry::new(".", 1);
        assert!(de.matches("."));
        assert!(!de.matches(".."));
    }

    #[test]
    fn log_header_keeps_listed_blocks() {
        let hdr = LogHeader::from_blocks(&[40, 7, 99]);
        let mut buf = [0u8; BSIZE];
        encode_into(&mut buf, &hdr);
        let back: LogHeader = decode(&buf);
        assert_eq!(back.to_blocks(), vec![40, 7, 99]);
    }

    #[test]
    fn indirect_slots_are_little_endian() {
        let mut block = [0u8; BSIZE];
        indirect_set(&mut block, 3, 0x0102_0304);
        assert_eq!(&block[12..16], &[4, 3, 2, 1]);
        assert_eq!(indirect_get(&block, 3), 0x0102_0304);
        assert_eq!(indirect_get(&block, 4), 0);
    }
}
