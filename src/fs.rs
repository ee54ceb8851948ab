use super::*;
use bitmap::BitMap;
use block_cache::BlockCache;
use block_device::BlockDevice;
use disk::{decode, encode_into, FileKind, LogHeader, SuperBlock};
use error::{FsError, Result};
use inode::{Inode, InodeGuard, InodeStat, InodeTable};
use logger::{LogManager, OpContext};

use log::{debug, info};
use std::sync::Arc;

/// One mounted file system: the device, its superblock and every layer built
/// on them. Independent instances share nothing.
pub struct FileSystem {
    super_blk: SuperBlock,
    blk_cch: Arc<BlockCache>,
    log_mgr: Arc<LogManager>,
    bitmap: Arc<BitMap>,
    inodes: InodeTable,
}

/// One more link, fatal when the 16-bit count would wrap.
fn bump_nlink(nlink: u16, path: &str) -> u16 {
    nlink
        .checked_add(1)
        .unwrap_or_else(|| panic!("link: too many links to {path}"))
}

impl FileSystem {
    /// mkfs: lay out `size` blocks with room for `ninodes` inodes, create the
    /// root directory and return the mounted file system.
    pub fn format(blk_dev: Arc<dyn BlockDevice>, size: usize, ninodes: usize) -> Result<Self> {
        if ninodes <= ROOTINO + 1 || ninodes > u16::MAX as usize + 1 {
            return Err(FsError::Layout(format!("{ninodes} inodes")));
        }
        let nlog = LOGSIZE + 1;
        let ninodeblocks = ninodes / IPB + 1;
        let nbitmap = size / BPB + 1;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        if size <= nmeta {
            return Err(FsError::Layout(format!(
                "{size} blocks cannot hold {nmeta} metadata blocks"
            )));
        }
        if size > blk_dev.nblocks() {
            return Err(FsError::Layout(format!(
                "{size} blocks on a device of {}",
                blk_dev.nblocks()
            )));
        }

        let super_blk = SuperBlock {
            magic: FSMAGIC,
            size: size as u32,
            nblocks: (size - nmeta) as u32,
            ninodes: ninodes as u32,
            nlog: nlog as u32,
            logstart: 2,
            inodestart: (2 + nlog) as u32,
            bmapstart: (2 + nlog + ninodeblocks) as u32,
        };
        info!(
            "mkfs: nmeta {nmeta} (boot, super, log {nlog}, inode {ninodeblocks}, bitmap {nbitmap}) blocks {} total {size}",
            size - nmeta
        );

        let zeroes = [0u8; BSIZE];
        for bno in 0..nmeta {
            blk_dev.write_block(bno, &zeroes);
        }
        let mut buf = [0u8; BSIZE];
        encode_into(&mut buf, &super_blk);
        blk_dev.write_block(1, &buf);

        // metadata blocks are never handed out by balloc
        let mut bits = vec![[0u8; BSIZE]; nbitmap];
        for bno in 0..nmeta {
            bits[bno / BPB][(bno % BPB) / 8] |= 1 << (bno % 8);
        }
        for (i, block) in bits.iter().enumerate() {
            blk_dev.write_block(super_blk.bmapstart as usize + i, block);
        }

        let fs = Self::mount(blk_dev)?;
        let ctx = fs.begin_op();
        let inum = fs.inodes.alloc(&ctx, FileKind::Directory);
        assert_eq!(inum, ROOTINO, "mkfs: root is inode {inum}");
        let root = fs.inodes.get(inum);
        let mut guard = fs.inodes.lock(&root);
        guard.nlink = 1;
        fs.inodes.sync(Some(&ctx), &guard);
        fs.inodes.insert(&ctx, &mut guard, ".", ROOTINO);
        fs.inodes.insert(&ctx, &mut guard, "..", ROOTINO);
        drop(guard);
        fs.inodes.put(&ctx, root);
        fs.end_op(ctx);
        Ok(fs)
    }

    /// Read the superblock, replay the log, and bring up every layer.
    pub fn mount(blk_dev: Arc<dyn BlockDevice>) -> Result<Self> {
        let dev_blocks = blk_dev.nblocks();
        if dev_blocks < 2 {
            return Err(FsError::Layout(format!("device of {dev_blocks} blocks")));
        }
        let blk_cch = Arc::new(BlockCache::new(blk_dev));
        let super_blk: SuperBlock = decode(&blk_cch.acquire(1)[..]);
        if super_blk.magic != FSMAGIC {
            return Err(FsError::BadMagic(super_blk.magic));
        }
        let sb = &super_blk;
        let (logstart, nlog) = (sb.logstart as usize, sb.nlog as usize);
        let regions_ok = nlog > MAXOPBLOCKS
            && logstart >= 2
            && sb.inodestart as usize >= logstart + nlog
            && sb.bmapstart > sb.inodestart
            && sb.nblocks < sb.size
            && (sb.size - sb.nblocks) > sb.bmapstart
            && sb.ninodes as usize <= (sb.bmapstart - sb.inodestart) as usize * IPB
            && sb.size as usize <= dev_blocks;
        if !regions_ok {
            return Err(FsError::Layout(format!("{super_blk:?} on {dev_blocks} blocks")));
        }
        // replay writes wherever the header points
        let hdr: LogHeader = decode(&blk_cch.acquire(logstart)[..]);
        let listed = hdr.n as usize;
        if listed > LOGSIZE.min(nlog - 1)
            || hdr.blocks[..listed].iter().any(|&b| b as usize >= sb.size as usize)
        {
            return Err(FsError::Layout(format!("log header lists {listed} blocks")));
        }

        let log_mgr = Arc::new(LogManager::new(&super_blk, blk_cch.clone()));
        let bitmap = Arc::new(BitMap::new(&super_blk, blk_cch.clone(), log_mgr.clone()));
        let inodes = InodeTable::new(super_blk, blk_cch.clone(), log_mgr.clone(), bitmap.clone());
        info!(
            "mount: {} blocks, {} inodes, log at {}",
            super_blk.size, super_blk.ninodes, super_blk.logstart
        );
        Ok(Self {
            super_blk,
            blk_cch,
            log_mgr,
            bitmap,
            inodes,
        })
    }

    pub fn super_blk(&self) -> &SuperBlock {
        &self.super_blk
    }

    pub fn blk_cch(&self) -> &Arc<BlockCache> {
        &self.blk_cch
    }

    pub fn log_mgr(&self) -> &Arc<LogManager> {
        &self.log_mgr
    }

    pub fn bitmap(&self) -> &Arc<BitMap> {
        &self.bitmap
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn begin_op(&self) -> OpContext {
        self.log_mgr.begin_op()
    }

    pub fn end_op(&self, ctx: OpContext) {
        self.log_mgr.end_op(ctx)
    }

    pub fn open(&self, ctx: &OpContext, path: &str) -> Result<Arc<Inode>> {
        self.inodes
            .namei(ctx, path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Drop a reference in a transaction of its own.
    pub fn close(&self, inode: Arc<Inode>) {
        let ctx = self.begin_op();
        self.inodes.put(&ctx, inode);
        self.end_op(ctx);
    }

    /// Create `path`. An existing regular file is returned as is when a
    /// regular file is asked for; anything else already there is an error.
    pub fn create(&self, ctx: &OpContext, path: &str, kind: FileKind) -> Result<Arc<Inode>> {
        let inodes = &self.inodes;
        let (dir, name) = inodes
            .nameiparent(ctx, path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if name == "." || name == ".." {
            inodes.put(ctx, dir);
            return Err(FsError::InvalidPath(path.to_string()));
        }

        let mut dguard = inodes.lock(&dir);
        if let Some((inum, _)) = inodes.lookup(&dguard, &name) {
            let ip = inodes.get(inum);
            drop(dguard);
            inodes.put(ctx, dir);
            let existing = inodes.lock(&ip).kind;
            if kind == FileKind::File && existing == FileKind::File {
                return Ok(ip);
            }
            inodes.put(ctx, ip);
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        let ip = inodes.get(inodes.alloc(ctx, kind));
        let mut guard = inodes.lock(&ip);
        guard.nlink = 1;
        inodes.sync(Some(ctx), &guard);
        if kind == FileKind::Directory {
            // for ".."
            dguard.nlink = bump_nlink(dguard.nlink, path);
            inodes.sync(Some(ctx), &dguard);
            inodes.insert(ctx, &mut guard, ".", ip.inum());
            inodes.insert(ctx, &mut guard, "..", dir.inum());
        }
        drop(guard);
        let linked = inodes.insert(ctx, &mut dguard, &name, ip.inum());
        assert!(linked.is_some(), "create: {name} appeared under a locked directory");
        drop(dguard);
        inodes.put(ctx, dir);
        debug!("create: {path} -> inode {}", ip.inum());
        Ok(ip)
    }

    /// Add a second name `new` for the file at `old`.
    pub fn link(&self, ctx: &OpContext, old: &str, new: &str) -> Result<()> {
        let inodes = &self.inodes;
        let ip = self.open(ctx, old)?;
        {
            let mut guard = inodes.lock(&ip);
            if guard.kind == FileKind::Directory {
                drop(guard);
                inodes.put(ctx, ip);
                return Err(FsError::IsADirectory(old.to_string()));
            }
            guard.nlink = bump_nlink(guard.nlink, old);
            inodes.sync(Some(ctx), &guard);
        }

        let linked = match inodes.nameiparent(ctx, new) {
            Some((dir, name)) => {
                let mut dguard = inodes.lock(&dir);
                let res = if dguard.kind != FileKind::Directory {
                    Err(FsError::NotADirectory(new.to_string()))
                } else {
                    inodes
                        .insert(ctx, &mut dguard, &name, ip.inum())
                        .map(|_| ())
                        .ok_or_else(|| FsError::AlreadyExists(new.to_string()))
                };
                drop(dguard);
                inodes.put(ctx, dir);
                res
            }
            None => Err(FsError::NotFound(new.to_string())),
        };

        if linked.is_err() {
            let mut guard = inodes.lock(&ip);
            guard.nlink -= 1;
            inodes.sync(Some(ctx), &guard);
        }
        inodes.put(ctx, ip);
        linked
    }

    /// Remove the name `path`. The inode itself goes away with its last
    /// reference.
    pub fn unlink(&self, ctx: &OpContext, path: &str) -> Result<()> {
        let inodes = &self.inodes;
        let (dir, name) = inodes
            .nameiparent(ctx, path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if name == "." || name == ".." {
            inodes.put(ctx, dir);
            return Err(FsError::InvalidPath(path.to_string()));
        }

        let mut dguard = inodes.lock(&dir);
        let Some((inum, off)) = inodes.lookup(&dguard, &name) else {
            drop(dguard);
            inodes.put(ctx, dir);
            return Err(FsError::NotFound(path.to_string()));
        };
        let ip = inodes.get(inum);
        let mut guard = inodes.lock(&ip);
        assert!(guard.nlink >= 1, "unlink: nlink < 1");
        if guard.kind == FileKind::Directory && !self.is_dir_empty(&guard) {
            drop(guard);
            drop(dguard);
            inodes.put(ctx, ip);
            inodes.put(ctx, dir);
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }

        inodes.remove(ctx, &mut dguard, off);
        if guard.kind == FileKind::Directory {
            dguard.nlink -= 1;
            inodes.sync(Some(ctx), &dguard);
        }
        guard.nlink -= 1;
        inodes.sync(Some(ctx), &guard);
        // both unlocked before either put
        drop(guard);
        drop(dguard);
        inodes.put(ctx, dir);
        inodes.put(ctx, ip);
        debug!("unlink: {path}");
        Ok(())
    }

    fn is_dir_empty(&self, guard: &InodeGuard<'_>) -> bool {
        self.inodes
            .entries(guard)
            .iter()
            .all(|(name, _)| name == "." || name == "..")
    }

    /// Write `src` at `offset`, split into transactions small enough for the
    /// log.
    pub fn write_file(&self, inode: &Arc<Inode>, src: &[u8], offset: usize) -> usize {
        let mut done = 0;
        while done < src.len() {
            let n = (src.len() - done).min(MAXOPBYTES);
            let ctx = self.begin_op();
            let mut guard = self.inodes.lock(inode);
            self.inodes.write(&ctx, &mut guard, &src[done..done + n], offset + done);
            drop(guard);
            self.end_op(ctx);
            done += n;
        }
        done
    }

    pub fn read_file(&self, inode: &Arc<Inode>, dst: &mut [u8], offset: usize) -> usize {
        let guard = self.inodes.lock(inode);
        self.inodes.read(&guard, dst, offset)
    }

    pub fn stat(&self, inode: &Arc<Inode>) -> InodeStat {
        let guard = self.inodes.lock(inode);
        self.inodes.stat(&guard)
    }

    /// Live entries of the directory `inode`.
    pub fn read_dir(&self, inode: &Arc<Inode>) -> Result<Vec<(String, usize)>> {
        let guard = self.inodes.lock(inode);
        if guard.kind != FileKind::Directory {
            return Err(FsError::NotADirectory(format!("inode {}", inode.inum())));
        }
        Ok(self.inodes.entries(&guard))
    }
}
