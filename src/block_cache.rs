use super::*;
use block_device::BlockDevice;
use sleep_lock::SleepLock;

use log::{trace, warn};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One cached block. The content sits behind the block's own sleeping lock;
/// the cache-wide lock only guards membership and recency.
pub struct Block {
    blockno: usize,
    /// has data been read from disk?
    valid: AtomicBool,
    /// holds an uncommitted transaction's content, must not be evicted
    pinned: AtomicBool,
    data: SleepLock<[u8; BSIZE]>,
}

impl Block {
    fn new(blockno: usize) -> Self {
        Self {
            blockno,
            valid: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            data: SleepLock::new([0u8; BSIZE]),
        }
    }
}

struct Slot {
    block: Arc<Block>,
    /// holders plus waiters; non-zero means acquired
    refcnt: usize,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<usize /* blockno */, Slot>,
    /// most recently used at the front
    lru: VecDeque<usize>,
}

impl CacheState {
    fn touch(&mut self, blockno: usize) {
        if let Some(pos) = self.lru.iter().position(|&b| b == blockno) {
            self.lru.remove(pos);
        }
        self.lru.push_front(blockno);
    }

    /// Drop least recently used entries that are neither acquired nor pinned
    /// until we are under `threshold`, or nothing else is evictable.
    fn evict(&mut self, threshold: usize) {
        let mut pos = self.lru.len();
        while self.slots.len() >= threshold && pos > 0 {
            pos -= 1;
            let blockno = self.lru[pos];
            let slot = &self.slots[&blockno];
            if slot.refcnt == 0 && !slot.block.pinned.load(Ordering::Acquire) {
                trace!("bcache: evict block {blockno}");
                self.slots.remove(&blockno);
                self.lru.remove(pos);
            }
        }
        if self.slots.len() >= threshold {
            warn!("bcache: {} blocks cached, none evictable", self.slots.len());
        }
    }
}

pub struct BlockCache {
    blk_dev: Arc<dyn BlockDevice>,
    threshold: usize,
    state: Mutex<CacheState>,
}

impl BlockCache {
    pub fn new(blk_dev: Arc<dyn BlockDevice>) -> Self {
        Self::with_threshold(blk_dev, EVICTION_THRESHOLD)
    }

    pub fn with_threshold(blk_dev: Arc<dyn BlockDevice>, threshold: usize) -> Self {
        Self {
            blk_dev,
            threshold,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn block_device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.blk_dev)
    }

    /// Exclusive access to block `blockno`, loading it from disk on a miss.
    /// Two acquirers of the same block serialize on that block's lock;
    /// unrelated blocks never contend.
    pub fn acquire(&self, blockno: usize) -> BlockGuard<'_> {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&blockno) {
            slot.refcnt += 1;
            let block = Arc::clone(&slot.block);
            state.touch(blockno);
            drop(state);
            block.data.raw_lock();
            return BlockGuard { cache: self, block };
        }

        state.evict(self.threshold);
        // published locked, so a second acquirer waits for our read
        // instead of loading its own copy
        let block = Arc::new(Block::new(blockno));
        block.data.raw_lock();
        state.slots.insert(
            blockno,
            Slot {
                block: Arc::clone(&block),
                refcnt: 1,
            },
        );
        state.lru.push_front(blockno);
        drop(state);

        let mut guard = BlockGuard { cache: self, block };
        self.blk_dev.read_block(blockno, &mut guard[..]);
        guard.block.valid.store(true, Ordering::Release);
        guard
    }

    /// Give up access to a block. Same as dropping the guard.
    pub fn release(&self, guard: BlockGuard<'_>) {
        drop(guard);
    }

    fn release_block(&self, block: &Block) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&block.blockno) {
            slot.refcnt -= 1;
        }
        block.data.raw_unlock();
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn is_cached(&self, blockno: usize) -> bool {
        self.state.lock().unwrap().slots.contains_key(&blockno)
    }
}

/// Held access to one block's content. Dropping it releases the block.
pub struct BlockGuard<'a> {
    cache: &'a BlockCache,
    block: Arc<Block>,
}

impl BlockGuard<'_> {
    pub fn blockno(&self) -> usize {
        self.block.blockno
    }

    pub fn is_valid(&self) -> bool {
        self.block.valid.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.block.pinned.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.block.pinned.store(true, Ordering::Release);
    }

    pub(crate) fn unpin(&self) {
        self.block.pinned.store(false, Ordering::Release);
    }

    /// block(mem) -> block(disk)
    pub fn write(&self) {
        self.cache.blk_dev.write_block(self.block.blockno, &self[..]);
    }
}

impl Deref for BlockGuard<'_> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        unsafe { self.block.data.get() }
    }
}

impl DerefMut for BlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        unsafe { self.block.data.get_mut() }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_block(&self.block);
    }
}
