//! Whether an out-of-space claim is worth retrying.
//!
//! Deletes and truncates pin freed clusters until their transaction
//! commits. When the journal holds such frees, forcing a commit releases
//! them and the claim may succeed on the next attempt.

use crate::accountant::{Caller, ClaimFlags, FreeSpaceAccountant};
use fsa_error::Result;
use fsa_journal::Journal;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RetryPolicy {
    accountant: Arc<FreeSpaceAccountant>,
    journal: Option<Arc<dyn Journal>>,
    max_retries: u32,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("journal", &self.journal.is_some())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        accountant: Arc<FreeSpaceAccountant>,
        journal: Option<Arc<dyn Journal>>,
        max_retries: u32,
    ) -> Self {
        Self {
            accountant,
            journal,
            max_retries,
        }
    }

    /// Decide whether to retry after `NoSpace`, bumping `retries`.
    ///
    /// Declines when not even one cluster is free for `caller`, once
    /// `retries` passes the limit, or without a journal. Otherwise forces a
    /// commit if the journal holds pinned frees and asks for a retry.
    pub fn should_retry(&self, retries: &mut u32, caller: &Caller) -> Result<bool> {
        if !self.accountant.has_free(1, ClaimFlags::NONE, caller) {
            return Ok(false);
        }
        *retries += 1;
        if *retries > self.max_retries {
            debug!(retries = *retries, "retry: limit reached");
            return Ok(false);
        }
        let Some(journal) = &self.journal else {
            return Ok(false);
        };
        if journal.has_pending_free() {
            warn!(retries = *retries, "retry: forcing journal commit to release freed clusters");
            journal.force_commit_nested()?;
        }
        Ok(true)
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
