//! Write-ahead log. A typical use is:
//!   ctx = log.begin_op()
//!   block = cache.acquire(...)
//!   modify block[..]
//!   log.sync(Some(&ctx), &block)
//!   drop(block)
//!   log.end_op(ctx)
//!
//! All operations outstanding at the same time are committed together by the
//! last one to finish (group commit). On-disk log format:
//!   header block (count + home block numbers), then one slot per listed block.

use super::*;
use block_cache::{BlockCache, BlockGuard};
use disk::{decode, encode_into, LogHeader, SuperBlock};

use log::{debug, info};
use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};

/// Handle of one admitted operation, handed back to `end_op`.
#[must_use = "an operation must be ended with end_op"]
pub struct OpContext {
    /// blocks this op added to the header
    appended: Cell<usize>,
}

impl OpContext {
    pub fn blocks_appended(&self) -> usize {
        self.appended.get()
    }
}

#[derive(Default)]
struct LogState {
    /// how many FS ops are executing
    outstanding: usize,
    /// in commit(), please wait
    committing: bool,
    /// home block numbers of the current batch, mirrors the header at commit
    blocks: Vec<usize>,
    /// bumped after every commit, end_op waiters watch it
    epoch: u64,
    commits: u64,
}

pub struct LogManager {
    /// header block
    start: usize,
    /// # of slots the log region holds
    capacity: usize,
    blk_cch: Arc<BlockCache>,
    state: Mutex<LogState>,
    /// begin_op waits here for room or for a commit to finish
    admit: Condvar,
    /// end_op waits here for the commit that covers it
    done: Condvar,
}

impl LogManager {
    /// Attach to the log region described by `sb` and replay whatever a crash
    /// left in it.
    pub fn new(sb: &SuperBlock, blk_cch: Arc<BlockCache>) -> Self {
        assert!(sb.nlog >= 2, "log: region of {} blocks", sb.nlog);
        let log_mgr = LogManager {
            start: sb.logstart as usize,
            capacity: LOGSIZE.min(sb.nlog as usize - 1),
            blk_cch,
            state: Mutex::new(LogState::default()),
            admit: Condvar::new(),
            done: Condvar::new(),
        };
        log_mgr.recover();
        log_mgr
    }

    /// log_hdr(disk) -> block list
    fn read_head(&self) -> Vec<usize> {
        let block = self.blk_cch.acquire(self.start);
        decode::<LogHeader>(&block[..]).to_blocks()
    }

    /// block list -> log_hdr(disk)
    fn write_head(&self, blocks: &[usize]) {
        let mut block = self.blk_cch.acquire(self.start);
        block.fill(0);
        encode_into(&mut block[..], &LogHeader::from_blocks(blocks));
        block.write();
    }

    /// data blocks(cache) -> log slots(disk)
    fn write_log(&self, blocks: &[usize]) {
        for (i, &bno) in blocks.iter().enumerate() {
            let from = self.blk_cch.acquire(bno);
            let mut to = self.blk_cch.acquire(self.start + i + 1);
            to.copy_from_slice(&from[..]);
            to.write();
        }
    }

    /// cached copies -> home locations(disk), releasing their pins
    fn install_trans(&self, blocks: &[usize]) {
        for &bno in blocks {
            let block = self.blk_cch.acquire(bno);
            block.write();
            block.unpin();
        }
    }

    /// log slots(disk) -> home locations(disk)
    fn replay(&self, blocks: &[usize]) {
        for (i, &bno) in blocks.iter().enumerate() {
            let from = self.blk_cch.acquire(self.start + i + 1);
            let mut to = self.blk_cch.acquire(bno);
            to.copy_from_slice(&from[..]);
            to.write();
        }
    }

    /// Redo a committed batch left behind by a crash, then empty the header.
    /// Safe to run any number of times.
    pub fn recover(&self) {
        let blocks = self.read_head();
        if !blocks.is_empty() {
            info!("log: recovering {} blocks", blocks.len());
            self.replay(&blocks);
        }
        self.write_head(&[]);
    }

    pub fn begin_op(&self) -> OpContext {
        let mut state = self.state.lock().unwrap();
        while state.committing
            || state.blocks.len() + (state.outstanding + 1) * MAXOPBLOCKS > self.capacity
        {
            state = self.admit.wait(state).unwrap();
        }
        state.outstanding += 1;
        OpContext {
            appended: Cell::new(0),
        }
    }

    /// Record that `block` was modified by `ctx`. Without a context the block
    /// goes straight to disk (recovery and mkfs).
    pub fn sync(&self, ctx: Option<&OpContext>, block: &BlockGuard<'_>) {
        let Some(ctx) = ctx else {
            block.write();
            return;
        };

        let mut state = self.state.lock().unwrap();
        assert!(state.outstanding > 0, "sync: outside of transaction");
        block.pin();
        let bno = block.blockno();
        if state.blocks.contains(&bno) {
            return; // log absorption
        }
        assert!(
            ctx.appended.get() < MAXOPBLOCKS,
            "sync: op wrote more than {MAXOPBLOCKS} blocks"
        );
        assert!(state.blocks.len() < self.capacity, "sync: log full");
        state.blocks.push(bno);
        ctx.appended.set(ctx.appended.get() + 1);
    }

    /// Finish an operation. Only the last outstanding operation commits; the
    /// others wait until that commit has made their writes durable.
    pub fn end_op(&self, ctx: OpContext) {
        drop(ctx);
        let mut state = self.state.lock().unwrap();
        assert!(!state.committing, "end_op: commit in progress");
        state.outstanding -= 1;
        if state.outstanding > 0 {
            let epoch = state.epoch;
            self.admit.notify_one();
            while state.epoch == epoch {
                state = self.done.wait(state).unwrap();
            }
            return;
        }

        state.committing = true;
        let blocks = state.blocks.clone();
        drop(state);

        self.commit(&blocks);

        let mut state = self.state.lock().unwrap();
        state.blocks.clear();
        state.committing = false;
        state.epoch += 1;
        if !blocks.is_empty() {
            state.commits += 1;
        }
        self.admit.notify_all();
        self.done.notify_all();
    }

    fn commit(&self, blocks: &[usize]) {
        if blocks.is_empty() {
            return;
        }
        debug!("log: commit {} blocks", blocks.len());
        self.write_log(blocks);
        self.write_head(blocks); // the real commit
        self.install_trans(blocks);
        self.write_head(&[]); // erase the transaction from the log
    }

    /// # of non-empty batches committed since mount
    pub fn commit_count(&self) -> u64 {
        self.state.lock().unwrap().commits
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    /// home block numbers waiting for the next commit
    pub fn pending_blocks(&self) -> Vec<usize> {
        self.state.lock().unwrap().blocks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::{BlockDevice, MemDisk};
    use std::sync::mpsc;
    use std::thread;

    const NBLOCKS: usize = 128;
    const DATA: usize = 64;

    fn log_sb() -> SuperBlock {
        SuperBlock {
            size: NBLOCKS as u32,
            nlog: (LOGSIZE + 1) as u32,
            logstart: 2,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemDisk>, Arc<BlockCache>, LogManager) {
        let disk = Arc::new(MemDisk::new(NBLOCKS));
        let cache = Arc::new(BlockCache::new(disk.clone()));
        let log_mgr = LogManager::new(&log_sb(), cache.clone());
        (disk, cache, log_mgr)
    }

    fn stamp(cache: &BlockCache, log_mgr: &LogManager, ctx: &OpContext, bno: usize, byte: u8) {
        let mut block = cache.acquire(bno);
        block.fill(byte);
        log_mgr.sync(Some(ctx), &block);
    }

    #[test]
    fn commit_installs_and_clears_header() {
        let (disk, cache, log_mgr) = setup();
        let ctx = log_mgr.begin_op();
        stamp(&cache, &log_mgr, &ctx, DATA, 1);
        stamp(&cache, &log_mgr, &ctx, DATA + 1, 2);
        stamp(&cache, &log_mgr, &ctx, DATA, 3);
        assert_eq!(ctx.blocks_appended(), 2);
        assert_eq!(disk.read_raw(DATA), [0u8; BSIZE]);
        assert!(cache.acquire(DATA).is_pinned());
        log_mgr.end_op(ctx);

        assert_eq!(log_mgr.commit_count(), 1);
        assert_eq!(disk.read_raw(DATA), [3u8; BSIZE]);
        assert_eq!(disk.read_raw(DATA + 1), [2u8; BSIZE]);
        assert!(!cache.acquire(DATA).is_pinned());
        let hdr: LogHeader = decode(&disk.read_raw(2));
        assert_eq!(hdr.n, 0);
    }

    #[test]
    fn empty_op_does_not_commit() {
        let (disk, _cache, log_mgr) = setup();
        let before = disk.writes();
        let ctx = log_mgr.begin_op();
        log_mgr.end_op(ctx);
        assert_eq!(log_mgr.commit_count(), 0);
        assert_eq!(disk.writes(), before);
    }

    #[test]
    fn sync_without_context_writes_through() {
        let (disk, cache, log_mgr) = setup();
        let mut block = cache.acquire(DATA);
        block.fill(5);
        log_mgr.sync(None, &block);
        assert!(!block.is_pinned());
        assert_eq!(disk.read_raw(DATA), [5u8; BSIZE]);
        assert!(log_mgr.pending_blocks().is_empty());
    }

    #[test]
    #[should_panic(expected = "more than")]
    fn per_op_limit_is_fatal() {
        let (_disk, cache, log_mgr) = setup();
        let ctx = log_mgr.begin_op();
        for i in 0..=MAXOPBLOCKS {
            stamp(&cache, &log_mgr, &ctx, DATA + i, 1);
        }
    }

    #[test]
    #[should_panic(expected = "outside of transaction")]
    fn sync_with_stale_context_is_fatal() {
        let (_disk, cache, log_mgr) = setup();
        let ctx = log_mgr.begin_op();
        let stale = OpContext {
            appended: Cell::new(0),
        };
        log_mgr.end_op(ctx);
        stamp(&cache, &log_mgr, &stale, DATA, 1);
    }

    #[test]
    fn recovery_replays_committed_header() {
        let disk = Arc::new(MemDisk::new(NBLOCKS));
        // a crash right after the header write: slots and header on disk,
        // home locations untouched
        disk.write_block(3, &[7u8; BSIZE]);
        disk.write_block(4, &[8u8; BSIZE]);
        let mut hdr = [0u8; BSIZE];
        encode_into(&mut hdr, &LogHeader::from_blocks(&[DATA, DATA + 5]));
        disk.write_block(2, &hdr);

        let cache = Arc::new(BlockCache::new(disk.clone()));
        let log_mgr = LogManager::new(&log_sb(), cache.clone());
        assert_eq!(disk.read_raw(DATA), [7u8; BSIZE]);
        assert_eq!(disk.read_raw(DATA + 5), [8u8; BSIZE]);
        assert_eq!(decode::<LogHeader>(&disk.read_raw(2)).n, 0);

        // idempotent
        let before = disk.writes();
        log_mgr.recover();
        assert_eq!(disk.writes(), before + 1);
        assert_eq!(disk.read_raw(DATA), [7u8; BSIZE]);
    }

    #[test]
    fn overlapping_ops_share_one_commit() {
        let (disk, cache, log_mgr) = setup();
        let (tx, rx) = mpsc::channel();
        let t1 = log_mgr.begin_op();
        for i in 0..3 {
            stamp(&cache, &log_mgr, &t1, DATA + i, 0x11);
        }
        thread::scope(|s| {
            s.spawn(|| {
                let t2 = log_mgr.begin_op();
                for i in 3..5 {
                    stamp(&cache, &log_mgr, &t2, DATA + i, 0x22);
                }
                tx.send(()).unwrap();
                log_mgr.end_op(t2);
            });
            rx.recv().unwrap();
            assert_eq!(log_mgr.pending_blocks().len(), 5);
            log_mgr.end_op(t1);
        });
        assert_eq!(log_mgr.commit_count(), 1);
        for i in 0..5 {
            let byte = if i < 3 { 0x11 } else { 0x22 };
            assert_eq!(disk.read_raw(DATA + i), [byte; BSIZE]);
        }
    }

    #[test]
    fn admission_waits_for_log_space() {
        let (disk, cache, log_mgr) = setup();
        let max_ops = log_mgr.capacity / MAXOPBLOCKS;
        thread::scope(|s| {
            for t in 0..max_ops * 3 {
                let (cache, log_mgr) = (&cache, &log_mgr);
                s.spawn(move || {
                    let ctx = log_mgr.begin_op();
                    assert!(log_mgr.outstanding() <= max_ops);
                    for j in 0..MAXOPBLOCKS {
                        stamp(cache, log_mgr, &ctx, DATA + (t * MAXOPBLOCKS + j) % 60, t as u8);
                    }
                    log_mgr.end_op(ctx);
                });
            }
        });
        assert_eq!(log_mgr.outstanding(), 0);
        assert!(log_mgr.pending_blocks().is_empty());
        assert!(log_mgr.commit_count() >= 3);
        assert_eq!(decode::<LogHeader>(&disk.read_raw(2)).n, 0);
    }
}
