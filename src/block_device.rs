use super::*;

use log::{error, trace};
use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Raw device: byte-exact read/write of one `BSIZE` block.
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, blockno: usize, buf: &mut [u8]);
    fn write_block(&self, blockno: usize, buf: &[u8]);
    /// # of blocks the device holds
    fn nblocks(&self) -> usize;
}

/// RAM disk. Writes can be cut off after a budget to simulate power loss:
/// everything written past the budget is silently dropped.
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
    budget: Mutex<Option<usize>>,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self::from_blocks(vec![[0u8; BSIZE]; nblocks])
    }

    fn from_blocks(blocks: Vec<[u8; BSIZE]>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
            budget: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Accept `n` more writes, then drop the rest.
    pub fn crash_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    /// Whether a crash budget has been used up.
    pub fn crashed(&self) -> bool {
        *self.budget.lock().unwrap() == Some(0)
    }

    /// Number of writes that actually reached the medium.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of the medium as it stands, with no crash budget.
    pub fn snapshot(&self) -> MemDisk {
        MemDisk::from_blocks(self.blocks.lock().unwrap().clone())
    }

    pub fn read_raw(&self, blockno: usize) -> [u8; BSIZE] {
        self.blocks.lock().unwrap()[blockno]
    }
}

impl BlockDevice for MemDisk {
    fn nblocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    fn read_block(&self, blockno: usize, buf: &mut [u8]) {
        let blocks = self.blocks.lock().unwrap();
        assert!(blockno < blocks.len(), "read_block: block {blockno} out of range");
        buf.copy_from_slice(&blocks[blockno]);
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) {
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => {
                trace!("memdisk: dropped write of block {blockno}");
                return;
            }
            Some(n) => *n -= 1,
            None => {}
        }
        let mut blocks = self.blocks.lock().unwrap();
        assert!(blockno < blocks.len(), "write_block: block {blockno} out of range");
        blocks[blockno].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Image file on the host. Block numbers are relative to `base`, the first
/// block of the partition inside the image.
pub struct FileDisk {
    file: Mutex<File>,
    base: usize,
    nblocks: usize,
}

impl FileDisk {
    /// Open an existing image. Fails when it cannot hold a boot block and a
    /// superblock past `base`.
    pub fn open(path: impl AsRef<Path>, base: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let nblocks = (len / BSIZE).saturating_sub(base);
        if nblocks < 2 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("image of {len} bytes has no superblock past block {base}"),
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            base,
            nblocks,
        })
    }

    /// Create (or truncate) an image holding `base + nblocks` blocks.
    pub fn create(path: impl AsRef<Path>, base: usize, nblocks: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(((base + nblocks) * BSIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            base,
            nblocks,
        })
    }

    fn offset(&self, blockno: usize) -> u64 {
        ((self.base + blockno) * BSIZE) as u64
    }
}

impl BlockDevice for FileDisk {
    fn nblocks(&self) -> usize {
        self.nblocks
    }

    // a failing disk leaves the log protocol with nothing to stand on
    fn read_block(&self, blockno: usize, buf: &mut [u8]) {
        let mut file = self.file.lock().unwrap();
        let res = file
            .seek(SeekFrom::Start(self.offset(blockno)))
            .and_then(|_| file.read_exact(buf));
        if let Err(e) = res {
            error!("filedisk: read of block {blockno} failed: {e}");
            panic!("read_block: {e}");
        }
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) {
        let mut file = self.file.lock().unwrap();
        let res = file
            .seek(SeekFrom::Start(self.offset(blockno)))
            .and_then(|_| file.write_all(buf));
        if let Err(e) = res {
            error!("filedisk: write of block {blockno} failed: {e}");
            panic!("write_block: {e}");
        }
    }
}
