//! One-shot read completion: a promise with a blocking join.
//!
//! A device hands out a [`PendingRead`] when a read is submitted and keeps
//! the matching [`ReadCompleter`] until the transfer finishes. Any number of
//! clones of the `PendingRead` may wait on the same transfer. There is no
//! cancellation: once submitted, a read runs to completion (or failure).

use crate::BlockBuf;
use fsa_error::{FsaError, Result};
use fsa_types::BlockNumber;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;

/// Failure recorded by a device for a single read.
///
/// Kept separate from `std::io::Error` so that every waiter can observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFault {
    pub kind: io::ErrorKind,
    pub detail: String,
}

impl ReadFault {
    #[must_use]
    pub fn new(kind: io::ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Outcome of a single block read.
pub type ReadOutcome = std::result::Result<BlockBuf, ReadFault>;

#[derive(Debug, Default)]
struct ReadSlot {
    outcome: Mutex<Option<ReadOutcome>>,
    done: Condvar,
}

impl ReadSlot {
    fn fill(&self, outcome: ReadOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.done.notify_all();
    }
}

/// Handle to an in-flight (or finished) block read.
#[derive(Debug, Clone)]
pub struct PendingRead {
    block: BlockNumber,
    slot: Arc<ReadSlot>,
}

impl PendingRead {
    /// A read that finished synchronously at submission time.
    #[must_use]
    pub fn ready(block: BlockNumber, outcome: ReadOutcome) -> Self {
        let slot = Arc::new(ReadSlot::default());
        slot.fill(outcome);
        Self { block, slot }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Whether the device has already delivered an outcome.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Whether two handles refer to the same submitted read.
    #[must_use]
    pub fn same_request(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Block the calling thread until the read completes.
    pub fn wait(&self) -> Result<BlockBuf> {
        let mut outcome = self.slot.outcome.lock();
        loop {
            match outcome.as_ref() {
                Some(Ok(buf)) => return Ok(buf.clone()),
                Some(Err(fault)) => {
                    return Err(FsaError::Io(io::Error::new(
                        fault.kind,
                        format!("read of block {} failed: {}", self.block, fault.detail),
                    )));
                }
                None => self.slot.done.wait(&mut outcome),
            }
        }
    }
}

/// Device-side half of a submitted read.
///
/// Dropping a completer without calling [`ReadCompleter::complete`] fails
/// the read so that waiters never hang.
#[derive(Debug)]
pub struct ReadCompleter {
    block: BlockNumber,
    slot: Option<Arc<ReadSlot>>,
}

impl ReadCompleter {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn complete(mut self, outcome: ReadOutcome) {
        if let Some(slot) = self.slot.take() {
            slot.fill(outcome);
        }
    }
}

impl Drop for ReadCompleter {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(ReadFault::new(
                io::ErrorKind::Interrupted,
                "read abandoned before completion",
            )));
        }
    }
}

/// Create a linked pending-read / completer pair for `block`.
#[must_use]
pub fn read_request(block: BlockNumber) -> (PendingRead, ReadCompleter) {
    let slot = Arc::new(ReadSlot::default());
    (
        PendingRead {
            block,
            slot: Arc::clone(&slot),
        },
        ReadCompleter {
            block,
            slot: Some(slot),
        },
    )
}
