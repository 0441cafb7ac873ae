//! In-memory block device.

use crate::completion::{PendingRead, ReadCompleter, ReadFault, ReadOutcome, read_request};
use crate::{BlockBuf, BlockDevice};
use fsa_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

/// Sparse in-memory device. Unwritten blocks read back as zeroes.
///
/// Reads can be made to fail per block, and can be held in flight
/// (`set_deferred(true)`) until [`MemBlockDevice::complete_deferred`] runs,
/// which lets callers observe the Loading state of an asynchronous read.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    failing: Mutex<HashSet<u64>>,
    deferred: AtomicBool,
    queued: Mutex<Vec<ReadCompleter>>,
    reads: AtomicU64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            deferred: AtomicBool::new(false),
            queued: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
        }
    }

    /// Store `data` at `block`, zero-padded or truncated to the block size.
    pub fn put_block(&self, block: BlockNumber, data: &[u8]) {
        let mut buf = vec![0_u8; self.block_size as usize];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.blocks.lock().insert(block.0, buf);
    }

    /// Current contents of `block`, if it was ever written.
    #[must_use]
    pub fn block(&self, block: BlockNumber) -> Option<Vec<u8>> {
        self.blocks.lock().get(&block.0).cloned()
    }

    /// Make every read of `block` fail until [`MemBlockDevice::heal`].
    pub fn fail_reads(&self, block: BlockNumber) {
        self.failing.lock().insert(block.0);
    }

    pub fn heal(&self, block: BlockNumber) {
        self.failing.lock().remove(&block.0);
    }

    /// Hold submitted reads in flight until `complete_deferred`.
    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Release);
    }

    /// Complete every queued read. Returns how many were completed.
    pub fn complete_deferred(&self) -> usize {
        let queued = std::mem::take(&mut *self.queued.lock());
        let n = queued.len();
        for completer in queued {
            let outcome = self.read_now(completer.block());
            completer.complete(outcome);
        }
        n
    }

    /// Number of reads submitted so far.
    #[must_use]
    pub fn reads_submitted(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    fn read_now(&self, block: BlockNumber) -> ReadOutcome {
        if block.0 >= self.block_count {
            return Err(ReadFault::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            ));
        }
        if self.failing.lock().contains(&block.0) {
            return Err(ReadFault::new(io::ErrorKind::Other, "injected media error"));
        }
        let data = self
            .blocks
            .lock()
            .get(&block.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; self.block_size as usize]);
        Ok(BlockBuf::new(data))
    }
}

impl BlockDevice for MemBlockDevice {
    fn submit_read(&self, block: BlockNumber) -> PendingRead {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.deferred.load(Ordering::Acquire) {
            trace!(block = block.0, "mem_block_device: read queued");
            let (pending, completer) = read_request(block);
            self.queued.lock().push(completer);
            return pending;
        }
        PendingRead::ready(block, self.read_now(block))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
