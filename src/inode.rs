use super::*;
use bitmap::BitMap;
use block_cache::BlockCache;
use disk::{decode, encode_into, indirect_get, indirect_set, DirEntry, DiskInode, FileKind, SuperBlock};
use logger::{LogManager, OpContext};
use sleep_lock::{SleepLock, SleepLockGuard};

use log::{debug, trace};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct InodeData {
    /// inode has been read from disk?
    valid: bool,
    /// copy of disk inode
    entry: DiskInode,
}

/// inode in memory
pub struct Inode {
    /// Inode number
    inum: usize,
    /// Reference count, only changed under the registry lock
    refcnt: AtomicUsize,
    data: SleepLock<InodeData>,
}

impl Inode {
    fn new(inum: usize) -> Self {
        Self {
            inum,
            refcnt: AtomicUsize::new(0),
            data: SleepLock::new(InodeData::default()),
        }
    }

    pub fn inum(&self) -> usize {
        self.inum
    }

    pub fn ref_count(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }
}

/// A locked inode. Derefs to the cached on-disk entry; changes reach the disk
/// only through `InodeTable::sync`.
pub struct InodeGuard<'a> {
    inode: &'a Inode,
    data: SleepLockGuard<'a, InodeData>,
}

impl InodeGuard<'_> {
    pub fn inum(&self) -> usize {
        self.inode.inum
    }
}

impl Deref for InodeGuard<'_> {
    type Target = DiskInode;

    fn deref(&self) -> &DiskInode {
        &self.data.entry
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut DiskInode {
        &mut self.data.entry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeStat {
    pub inum: usize,
    pub kind: FileKind,
    pub nlink: u16,
    pub size: usize,
}

pub struct InodeTable {
    sb: SuperBlock,
    blk_cch: Arc<BlockCache>,
    log_mgr: Arc<LogManager>,
    bitmap: Arc<BitMap>,
    registry: Mutex<HashMap<usize /* inum */, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new(
        sb: SuperBlock,
        blk_cch: Arc<BlockCache>,
        log_mgr: Arc<LogManager>,
        bitmap: Arc<BitMap>,
    ) -> Self {
        Self {
            sb,
            blk_cch,
            log_mgr,
            bitmap,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn entry_offset(inum: usize) -> usize {
        (inum % IPB) * DINODE_SIZE
    }

    /// Claim the first on-disk inode whose kind is invalid.
    ///
    /// # Panics
    /// When every inode is in use.
    pub fn alloc(&self, ctx: &OpContext, kind: FileKind) -> usize {
        assert!(kind != FileKind::Invalid, "ialloc: invalid kind");
        for inum in 1..self.sb.ninodes as usize {
            let mut block = self.blk_cch.acquire(self.sb.iblock(inum));
            let off = Self::entry_offset(inum);
            let dinode: DiskInode = decode(&block[off..off + DINODE_SIZE]);
            if dinode.kind == FileKind::Invalid {
                let fresh = DiskInode {
                    kind,
                    ..Default::default()
                };
                encode_into(&mut block[off..off + DINODE_SIZE], &fresh);
                self.log_mgr.sync(Some(ctx), &block);
                debug!("ialloc: inode {inum} as {kind:?}");
                return inum;
            }
        }
        panic!("ialloc: no inodes");
    }

    /// Reference to inode `inum`, shared with any existing holder. The on-disk
    /// entry is read on first `lock`.
    pub fn get(&self, inum: usize) -> Arc<Inode> {
        assert!(
            inum > 0 && inum < self.sb.ninodes as usize,
            "iget: inode {inum} out of range"
        );
        let mut registry = self.registry.lock().unwrap();
        let inode = registry
            .entry(inum)
            .or_insert_with(|| Arc::new(Inode::new(inum)));
        inode.refcnt.fetch_add(1, Ordering::AcqRel);
        Arc::clone(inode)
    }

    pub fn share(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _registry = self.registry.lock().unwrap();
        inode.refcnt.fetch_add(1, Ordering::AcqRel);
        Arc::clone(inode)
    }

    /// Drop a reference. The last reference to an inode with no links frees
    /// its blocks and the on-disk entry inside `ctx`.
    ///
    /// The caller must not hold the inode's lock. Only the last reference
    /// takes it, so dropping a shared reference never waits on a holder.
    pub fn put(&self, ctx: &OpContext, inode: Arc<Inode>) {
        {
            // test and drop under one registry lock
            let _registry = self.registry.lock().unwrap();
            if inode.ref_count() > 1 {
                inode.refcnt.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }

        let mut guard = self.lock(&inode);
        let freed = guard.nlink == 0;
        if freed {
            // no links, no other references: nobody can reach it any more
            self.clear(ctx, &mut guard);
            guard.kind = FileKind::Invalid;
            self.sync(Some(ctx), &guard);
            // ialloc may hand the number out before we leave the registry
            guard.data.valid = false;
        }
        // still locked, so an unlink cannot slip in between reading nlink
        // and dropping the reference
        let mut registry = self.registry.lock().unwrap();
        if inode.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 && freed {
            registry.remove(&inode.inum);
        }
        drop(registry);
        drop(guard);
        if freed {
            debug!("iput: freed inode {}", inode.inum);
        }
    }

    /// Lock the inode, reading it from disk if needed.
    pub fn lock<'a>(&self, inode: &'a Inode) -> InodeGuard<'a> {
        assert!(inode.ref_count() > 0, "ilock: inode {} not referenced", inode.inum);
        let mut data = inode.data.lock();
        if !data.valid {
            let block = self.blk_cch.acquire(self.sb.iblock(inode.inum));
            let off = Self::entry_offset(inode.inum);
            data.entry = decode(&block[off..off + DINODE_SIZE]);
            data.valid = true;
        }
        InodeGuard { inode, data }
    }

    pub fn unlock(&self, guard: InodeGuard<'_>) {
        drop(guard);
    }

    /// Copy the cached entry to its inode block, through the log when `ctx`
    /// is given.
    pub fn sync(&self, ctx: Option<&OpContext>, guard: &InodeGuard<'_>) {
        let mut block = self.blk_cch.acquire(self.sb.iblock(guard.inum()));
        let off = Self::entry_offset(guard.inum());
        encode_into(&mut block[off..off + DINODE_SIZE], &**guard);
        self.log_mgr.sync(ctx, &block);
    }

    /// Free every data block of the inode and set its size to zero.
    pub fn clear(&self, ctx: &OpContext, guard: &mut InodeGuard<'_>) {
        if guard.indirect != 0 {
            let addrs: Vec<u32> = {
                let block = self.blk_cch.acquire(guard.indirect as usize);
                (0..NINDIRECT).map(|i| indirect_get(&block, i)).collect()
            };
            for bno in addrs.into_iter().filter(|&b| b != 0) {
                self.bitmap.free(ctx, bno as usize);
            }
            self.bitmap.free(ctx, guard.indirect as usize);
            guard.indirect = 0;
        }
        for i in 0..NDIRECT {
            if guard.addrs[i] != 0 {
                self.bitmap.free(ctx, guard.addrs[i] as usize);
                guard.addrs[i] = 0;
            }
        }
        guard.size = 0;
        self.sync(Some(ctx), guard);
    }

    pub fn stat(&self, guard: &InodeGuard<'_>) -> InodeStat {
        InodeStat {
            inum: guard.inum(),
            kind: guard.kind,
            nlink: guard.nlink,
            size: guard.size as usize,
        }
    }

    /// Physical block of logical block `index`, 0 for a hole.
    fn bmap(&self, dinode: &DiskInode, index: usize) -> usize {
        if index < NDIRECT {
            return dinode.addrs[index] as usize;
        }
        let index = index - NDIRECT;
        if index >= NINDIRECT || dinode.indirect == 0 {
            return 0;
        }
        let block = self.blk_cch.acquire(dinode.indirect as usize);
        indirect_get(&block, index) as usize
    }

    /// Translate logical block `index` to a physical block. With a context,
    /// missing blocks (and the indirect block) are allocated; the flag tells
    /// whether a data block was. Without one, a hole maps to 0.
    pub fn map(&self, ctx: Option<&OpContext>, guard: &mut InodeGuard<'_>, index: usize) -> (usize, bool) {
        let Some(ctx) = ctx else {
            return (self.bmap(guard, index), false);
        };
        assert!(index < MAXFILE, "bmap: block {index} out of range");

        if index < NDIRECT {
            if guard.addrs[index] == 0 {
                guard.addrs[index] = self.bitmap.alloc(ctx) as u32;
                self.sync(Some(ctx), guard);
                return (guard.addrs[index] as usize, true);
            }
            return (guard.addrs[index] as usize, false);
        }

        let index = index - NDIRECT;
        if guard.indirect == 0 {
            guard.indirect = self.bitmap.alloc(ctx) as u32;
            self.sync(Some(ctx), guard);
        }
        let mut block = self.blk_cch.acquire(guard.indirect as usize);
        let bno = indirect_get(&block, index);
        if bno != 0 {
            return (bno as usize, false);
        }
        let bno = self.bitmap.alloc(ctx) as u32;
        indirect_set(&mut block, index, bno);
        self.log_mgr.sync(Some(ctx), &block);
        (bno as usize, true)
    }

    /// Read up to `dst.len()` bytes at `offset`, clipped to the file size.
    /// Returns the number of bytes read.
    pub fn read(&self, guard: &InodeGuard<'_>, dst: &mut [u8], offset: usize) -> usize {
        let size = guard.size as usize;
        if offset >= size {
            return 0;
        }
        let end = size.min(offset + dst.len());
        let mut pos = offset;
        while pos < end {
            let within = pos % BSIZE;
            let len = (BSIZE - within).min(end - pos);
            let out = &mut dst[pos - offset..pos - offset + len];
            match self.bmap(guard, pos / BSIZE) {
                0 => out.fill(0),
                bno => {
                    let block = self.blk_cch.acquire(bno);
                    out.copy_from_slice(&block[within..within + len]);
                }
            }
            pos += len;
        }
        end - offset
    }

    /// Write `src` at `offset`, growing the file as needed. The new size is
    /// logged before any data block, so a crash never exposes bytes that were
    /// not logged.
    ///
    /// # Panics
    /// When `offset` is past the end of file or the write would exceed
    /// `MAXFILE_BYTES`.
    pub fn write(&self, ctx: &OpContext, guard: &mut InodeGuard<'_>, src: &[u8], offset: usize) -> usize {
        let end = offset + src.len();
        assert!(offset <= guard.size as usize, "writei: offset {offset} past end of file");
        assert!(end <= MAXFILE_BYTES, "writei: {end} bytes exceeds max file size");

        if end > guard.size as usize {
            guard.size = end as u32;
            self.sync(Some(ctx), guard);
        }
        let mut pos = offset;
        while pos < end {
            let within = pos % BSIZE;
            let len = (BSIZE - within).min(end - pos);
            let (bno, _) = self.map(Some(ctx), guard, pos / BSIZE);
            let mut block = self.blk_cch.acquire(bno);
            block[within..within + len].copy_from_slice(&src[pos - offset..pos - offset + len]);
            self.log_mgr.sync(Some(ctx), &block);
            pos += len;
        }
        trace!("writei: inode {} [{offset}, {end})", guard.inum());
        src.len()
    }

    fn read_dirent(&self, guard: &InodeGuard<'_>, off: usize) -> DirEntry {
        let mut buf = [0u8; DIRENT_SIZE];
        let n = self.read(guard, &mut buf, off);
        assert_eq!(n, DIRENT_SIZE, "dirlookup: short directory entry");
        decode(&buf)
    }

    /// Find `name` in a directory: its inode number and the byte offset of its
    /// entry.
    pub fn lookup(&self, guard: &InodeGuard<'_>, name: &str) -> Option<(usize, usize)> {
        assert_eq!(guard.kind, FileKind::Directory, "dirlookup: not a directory");
        (0..guard.size as usize)
            .step_by(DIRENT_SIZE)
            .map(|off| (off, self.read_dirent(guard, off)))
            .find(|(_, de)| de.inum != 0 && de.matches(name))
            .map(|(off, de)| (de.inum as usize, off))
    }

    /// Add `name -> inum` to a directory, reusing the first free slot.
    /// Returns the entry's byte offset, or `None` when the name exists.
    pub fn insert(&self, ctx: &OpContext, guard: &mut InodeGuard<'_>, name: &str, inum: usize) -> Option<usize> {
        assert_eq!(guard.kind, FileKind::Directory, "dirlink: not a directory");
        assert!(inum > 0 && inum <= u16::MAX as usize, "dirlink: bad inode {inum}");
        let mut free = None;
        for off in (0..guard.size as usize).step_by(DIRENT_SIZE) {
            let de = self.read_dirent(guard, off);
            if de.inum == 0 {
                free.get_or_insert(off);
            } else if de.matches(name) {
                return None;
            }
        }
        let off = free.unwrap_or(guard.size as usize);
        self.write(ctx, guard, &DirEntry::new(name, inum as u16).to_bytes(), off);
        Some(off)
    }

    /// Turn the entry at byte offset `off` into a tombstone. The directory
    /// never shrinks.
    pub fn remove(&self, ctx: &OpContext, guard: &mut InodeGuard<'_>, off: usize) {
        let mut de = self.read_dirent(guard, off);
        de.inum = 0;
        self.write(ctx, guard, &de.to_bytes(), off);
    }

    /// Live entries of a directory, in storage order.
    pub fn entries(&self, guard: &InodeGuard<'_>) -> Vec<(String, usize)> {
        assert_eq!(guard.kind, FileKind::Directory, "entries: not a directory");
        (0..guard.size as usize)
            .step_by(DIRENT_SIZE)
            .map(|off| self.read_dirent(guard, off))
            .filter(|de| de.inum != 0)
            .map(|de| (de.name(), de.inum as usize))
            .collect()
    }

    pub fn root(&self) -> Arc<Inode> {
        self.get(ROOTINO)
    }

    /// Resolve a `/`-separated path from the root.
    pub fn namei(&self, ctx: &OpContext, path: &str) -> Option<Arc<Inode>> {
        self.namex(ctx, path, false).map(|(inode, _)| inode)
    }

    /// Resolve all but the last element of `path`; returns the parent
    /// directory and the last element. `None` for the root itself.
    pub fn nameiparent(&self, ctx: &OpContext, path: &str) -> Option<(Arc<Inode>, String)> {
        self.namex(ctx, path, true)
    }

    fn namex(&self, ctx: &OpContext, path: &str, parent: bool) -> Option<(Arc<Inode>, String)> {
        let mut ip = self.root();
        let mut elems = path.split('/').filter(|e| !e.is_empty()).peekable();
        while let Some(name) = elems.next() {
            let guard = self.lock(&ip);
            if guard.kind != FileKind::Directory {
                drop(guard);
                self.put(ctx, ip);
                return None;
            }
            if parent && elems.peek().is_none() {
                drop(guard);
                return Some((ip, name.to_string()));
            }
            // take the reference while the entry still names the inode
            let next = self.lookup(&guard, name).map(|(inum, _)| self.get(inum));
            drop(guard);
            let Some(next) = next else {
                self.put(ctx, ip);
                return None;
            };
            self.put(ctx, ip);
            ip = next;
        }
        if parent {
            self.put(ctx, ip);
            return None;
        }
        Some((ip, String::new()))
    }

    /// # of inodes in the in-memory registry
    pub fn num_cached_inodes(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}
