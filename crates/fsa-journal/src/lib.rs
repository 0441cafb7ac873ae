#![forbid(unsafe_code)]
//! Journal signals consumed by the free-space layer.
//!
//! Freed clusters stay pinned until the transaction that freed them
//! commits. The allocator only needs two things from the journal: whether
//! such pinned frees exist, and a way to force a synchronous commit that
//! releases them. [`MemJournal`] is an in-memory implementation that hands
//! released clusters to a registered hook.

use fsa_error::{FsaError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

pub trait Journal: Send + Sync {
    /// Commit the running transaction and wait for it, from inside a caller
    /// that may itself hold a transaction handle.
    fn force_commit_nested(&self) -> Result<()>;

    /// Whether committing would release clusters freed by earlier
    /// deletes or truncates.
    fn has_pending_free(&self) -> bool;
}

/// Called with the number of clusters a commit released.
pub type ReleaseHook = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory journal that pins freed clusters until the next commit.
#[derive(Default)]
pub struct MemJournal {
    pending_free: AtomicU64,
    commits: AtomicU64,
    fail_commits: AtomicBool,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl fmt::Debug for MemJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemJournal")
            .field("pending_free", &self.pending_free.load(Ordering::Relaxed))
            .field("commits", &self.commits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `clusters` freed by the running transaction.
    pub fn pin_free(&self, clusters: u64) {
        self.pending_free.fetch_add(clusters, Ordering::AcqRel);
        trace!(clusters, "journal: pinned freed clusters");
    }

    #[must_use]
    pub fn pending_free(&self) -> u64 {
        self.pending_free.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Install the callback that receives released clusters on commit.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.on_release.lock() = Some(hook);
    }

    /// Make subsequent commits fail with an I/O error.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Release);
    }
}

impl Journal for MemJournal {
    fn force_commit_nested(&self) -> Result<()> {
        if self.fail_commits.load(Ordering::Acquire) {
            return Err(FsaError::Io(io::Error::other("journal commit failed")));
        }
        let released = self.pending_free.swap(0, Ordering::AcqRel);
        let seq = self.commits.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(seq, released, "journal: forced commit");
        if released > 0 {
            if let Some(hook) = self.on_release.lock().as_ref() {
                hook(released);
            }
        }
        Ok(())
    }

    fn has_pending_free(&self) -> bool {
        self.pending_free.load(Ordering::Acquire) > 0
    }
}
