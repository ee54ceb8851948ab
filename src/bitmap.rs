use super::*;
use block_cache::BlockCache;
use disk::SuperBlock;
use logger::{LogManager, OpContext};

use log::trace;
use std::sync::{Arc, Mutex};

/// Free-block bitmap. Bit `b` covers block `b` of the device, so the bits of
/// the metadata region are set by mkfs and never cleared.
pub struct BitMap {
    start: usize,
    blocks: usize, // # of blocks, sum, including the meta_data blocks
    blk_cch: Arc<BlockCache>,
    log_mgr: Arc<LogManager>,
    /// held across scan-then-set so two allocators never pick the same bit
    lock: Mutex<()>,
}

fn bit_of(bno: usize) -> (usize /* byte */, u8 /* mask */) {
    let bj = bno % BPB;
    (bj / 8, 1 << (bj % 8))
}

impl BitMap {
    pub fn new(sb: &SuperBlock, blk_cch: Arc<BlockCache>, log_mgr: Arc<LogManager>) -> Self {
        Self {
            start: sb.bmapstart as usize,
            blocks: sb.size as usize,
            blk_cch,
            log_mgr,
            lock: Mutex::new(()),
        }
    }

    /// Claim the first free block, zero it, and return its number. Both the
    /// bitmap block and the zeroed block are logged in `ctx`.
    ///
    /// # Panics
    /// When the device is full.
    pub fn alloc(&self, ctx: &OpContext) -> usize {
        let _guard = self.lock.lock().unwrap();
        let bno = self
            .claim(ctx)
            .unwrap_or_else(|| panic!("balloc: out of blocks"));

        let mut block = self.blk_cch.acquire(bno);
        block.fill(0);
        self.log_mgr.sync(Some(ctx), &block);
        trace!("balloc: block {bno}");
        bno
    }

    fn claim(&self, ctx: &OpContext) -> Option<usize> {
        for base in (0..self.blocks).step_by(BPB) {
            let mut block = self.blk_cch.acquire(self.start + base / BPB);
            for bno in base..(base + BPB).min(self.blocks) {
                let (byte, mask) = bit_of(bno);
                if block[byte] & mask == 0 {
                    block[byte] |= mask;
                    self.log_mgr.sync(Some(ctx), &block);
                    return Some(bno);
                }
            }
        }
        None
    }

    /// # Panics
    /// When `bno` is already free.
    pub fn free(&self, ctx: &OpContext, bno: usize) {
        assert!(bno < self.blocks, "bfree: block {bno} out of range");
        let _guard = self.lock.lock().unwrap();
        let mut block = self.blk_cch.acquire(self.start + bno / BPB);
        let (byte, mask) = bit_of(bno);
        assert!(block[byte] & mask != 0, "bfree: freeing free block {bno}");
        block[byte] &= !mask;
        self.log_mgr.sync(Some(ctx), &block);
        trace!("bfree: block {bno}");
    }

    pub fn is_allocated(&self, bno: usize) -> bool {
        let _guard = self.lock.lock().unwrap();
        let block = self.blk_cch.acquire(self.start + bno / BPB);
        let (byte, mask) = bit_of(bno);
        block[byte] & mask != 0
    }

    /// # of free blocks, by a full scan
    pub fn count_free(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        (0..self.blocks)
            .step_by(BPB)
            .map(|base| {
                let block = self.blk_cch.acquire(self.start + base / BPB);
                (base..(base + BPB).min(self.blocks))
                    .filter(|&bno| {
                        let (byte, mask) = bit_of(bno);
                        block[byte] & mask == 0
                    })
                    .count()
            })
            .sum()
    }
}
