//! Global free-space counters and the claim policy.
//!
//! Free and dirty (claimed, not yet committed) clusters are tracked in
//! [`ShardedCounter`]s. `has_free` decides from the cheap approximate values
//! unless the margin left after the request drops under the watermark, in
//! which case it sums every shard first.
//!
//! ## Claim ladder
//!
//! | Tier | Who | Condition |
//! |------|-----|-----------|
//! | Ordinary | anyone | `free ≥ root_reserved + resv + n + dirty` |
//! | Privileged | reserved uid/gid, `CAP_SYS_RESOURCE`, or `USE_ROOT_BLOCKS` | `free ≥ n + dirty + resv` |
//! | Reserved pool | `USE_RESERVED` | `free ≥ n + dirty` |

use crate::config::AllocConfig;
use crate::counter::ShardedCounter;
use crate::geometry::FsGeometry;
use fsa_error::{FsaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, trace};

// ── Request identity ────────────────────────────────────────────────────────

/// Reservation tiers a claim may dip into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClaimFlags(pub u32);

impl ClaimFlags {
    pub const NONE: Self = Self(0);
    /// Treat the caller as privileged for the root-reserved pool.
    pub const USE_ROOT_BLOCKS: Self = Self(0x0001);
    /// Ignore every reservation (filesystem-critical metadata).
    pub const USE_RESERVED: Self = Self(0x0002);

    const KNOWN: &[(u32, &'static str)] = &[
        (Self::USE_ROOT_BLOCKS.0, "use_root_blocks"),
        (Self::USE_RESERVED.0, "use_reserved"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        Self::KNOWN
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for ClaimFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Credentials and identity of the task making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Request-scoped identifier; picks the counter shard and goal colour.
    pub request_id: u64,
    pub fsuid: u32,
    pub fsgid: u32,
    pub supplementary_gids: Vec<u32>,
    pub cap_sys_resource: bool,
}

impl Caller {
    /// Unprivileged caller with no supplementary groups.
    #[must_use]
    pub fn user(request_id: u64, fsuid: u32, fsgid: u32) -> Self {
        Self {
            request_id,
            fsuid,
            fsgid,
            supplementary_gids: Vec::new(),
            cap_sys_resource: false,
        }
    }

    /// uid/gid 0 with `CAP_SYS_RESOURCE`.
    #[must_use]
    pub fn root(request_id: u64) -> Self {
        Self {
            cap_sys_resource: true,
            ..Self::user(request_id, 0, 0)
        }
    }

    #[must_use]
    pub fn in_group(&self, gid: u32) -> bool {
        self.fsgid == gid || self.supplementary_gids.contains(&gid)
    }
}

/// Owner of the root-reserved pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservedOwners {
    pub uid: u32,
    pub gid: u32,
}

/// Exact counter values at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub free_clusters: i64,
    pub dirty_clusters: i64,
    pub free_inodes: i64,
    pub root_reserved: u64,
    pub reserved_clusters: u64,
}

// ── Accountant ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FreeSpaceAccountant {
    free: ShardedCounter,
    dirty: ShardedCounter,
    free_inodes: ShardedCounter,
    root_reserved: u64,
    resv_clusters: AtomicU64,
    total_clusters: u64,
    owners: ReservedOwners,
    watermark: i64,
    faulted: AtomicBool,
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl FreeSpaceAccountant {
    /// Accountant seeded with the mount-time free cluster and inode counts.
    pub fn new(
        geo: &FsGeometry,
        config: &AllocConfig,
        owners: ReservedOwners,
        free_clusters: u64,
        free_inodes: u64,
    ) -> Result<Self> {
        config.validate()?;
        let shards = config.resolved_shards();
        let batch = config.counter_batch;
        let acct = Self::assemble(
            ShardedCounter::new(to_i64(free_clusters), shards, batch),
            ShardedCounter::new(0, shards, batch),
            ShardedCounter::new(to_i64(free_inodes), shards, batch),
            geo.root_reserved_clusters(),
            geo.total_clusters(),
            owners,
            config.resolved_watermark(shards),
        );
        acct.set_reserved_clusters(config.resolved_reserved_clusters(geo.total_clusters()))?;
        debug!(
            free_clusters,
            free_inodes,
            shards,
            watermark = acct.watermark,
            root_reserved = acct.root_reserved,
            "accountant: counters seeded"
        );
        Ok(acct)
    }

    fn assemble(
        free: ShardedCounter,
        dirty: ShardedCounter,
        free_inodes: ShardedCounter,
        root_reserved: u64,
        total_clusters: u64,
        owners: ReservedOwners,
        watermark: u64,
    ) -> Self {
        Self {
            free,
            dirty,
            free_inodes,
            root_reserved,
            resv_clusters: AtomicU64::new(0),
            total_clusters,
            owners,
            watermark: to_i64(watermark),
            faulted: AtomicBool::new(false),
        }
    }

    #[expect(clippy::cast_possible_truncation)]
    fn shard(&self, caller: &Caller) -> usize {
        (caller.request_id % self.free.shard_count() as u64) as usize
    }

    fn is_privileged(&self, flags: ClaimFlags, caller: &Caller) -> bool {
        caller.fsuid == self.owners.uid
            || (self.owners.gid != 0 && caller.in_group(self.owners.gid))
            || caller.cap_sys_resource
            || flags.contains(ClaimFlags::USE_ROOT_BLOCKS)
    }

    // ── Decisions ────────────────────────────────────────────────────────────

    /// Whether `n` clusters may be claimed under `flags` by `caller`.
    #[must_use]
    pub fn has_free(&self, n: u64, flags: ClaimFlags, caller: &Caller) -> bool {
        let n = to_i64(n);
        let resv = to_i64(self.resv_clusters.load(Ordering::Acquire));
        let rsv = to_i64(self.root_reserved).saturating_add(resv);

        let mut free = self.free.read_positive();
        let mut dirty = self.dirty.read_positive();
        let margin = free.saturating_sub(n.saturating_add(rsv).saturating_add(dirty));
        if margin < self.watermark {
            free = self.free.sum_positive();
            dirty = self.dirty.sum_positive();
            trace!(free, dirty, n, "accountant: exact check near watermark");
        }

        let need = n.saturating_add(dirty);
        if free >= need.saturating_add(rsv) {
            return true;
        }
        if self.is_privileged(flags, caller) && free >= need.saturating_add(resv) {
            return true;
        }
        flags.contains(ClaimFlags::USE_RESERVED) && free >= need
    }

    /// Provisionally reserve `n` clusters as dirty. Nothing changes when
    /// the claim is refused.
    pub fn claim(&self, n: u64, flags: ClaimFlags, caller: &Caller) -> Result<()> {
        if self.is_faulted() {
            return Err(FsaError::Accounting(
                "counters faulted earlier in this mount".to_owned(),
            ));
        }
        if !self.has_free(n, flags, caller) {
            trace!(n, flags = %flags, uid = caller.fsuid, "accountant: claim refused");
            return Err(FsaError::NoSpace);
        }
        self.dirty.add(to_i64(n), self.shard(caller));
        trace!(n, flags = %flags, "accountant: claimed");
        Ok(())
    }

    // ── Counter adjustments ──────────────────────────────────────────────────

    /// Abandon a claim: the clusters go back to plain free space.
    pub fn release_claim(&self, n: u64, caller: &Caller) {
        self.dirty.add(-to_i64(n), self.shard(caller));
    }

    /// The claimed clusters are now set in a bitmap.
    pub fn commit_claim(&self, n: u64, caller: &Caller) {
        let shard = self.shard(caller);
        self.dirty.add(-to_i64(n), shard);
        self.free.add(-to_i64(n), shard);
    }

    /// Clusters returned to free space (freed bits became reusable).
    pub fn credit_freed(&self, n: u64, shard: usize) {
        self.free.add(to_i64(n), shard);
    }

    /// Drop a quarantined group's free clusters from the global count.
    pub fn quarantine_clusters(&self, n: u64) {
        self.free.add_global(-to_i64(n));
    }

    /// Drop a quarantined group's free inodes from the global count.
    pub fn quarantine_inodes(&self, n: u64) {
        self.free_inodes.add_global(-to_i64(n));
    }

    /// Change the filesystem-wide reservation; at most half the volume.
    pub fn set_reserved_clusters(&self, n: u64) -> Result<()> {
        if n > self.total_clusters / 2 {
            return Err(FsaError::InvalidArgument(format!(
                "reservation of {n} clusters exceeds half of {}",
                self.total_clusters
            )));
        }
        self.resv_clusters.store(n, Ordering::Release);
        Ok(())
    }

    // ── Exact path ───────────────────────────────────────────────────────────

    /// Sum every shard. A negative total means the counters no longer
    /// describe the volume: the mount stops accepting claims.
    pub fn resync(&self) -> Result<CounterSnapshot> {
        let snap = CounterSnapshot {
            free_clusters: self.free.sum(),
            dirty_clusters: self.dirty.sum(),
            free_inodes: self.free_inodes.sum(),
            root_reserved: self.root_reserved,
            reserved_clusters: self.reserved_clusters(),
        };
        debug!(
            free = snap.free_clusters,
            dirty = snap.dirty_clusters,
            inodes = snap.free_inodes,
            "accountant: resync"
        );
        if snap.free_clusters < 0 || snap.dirty_clusters < 0 || snap.free_inodes < 0 {
            let reason = format!(
                "negative counter: free={} dirty={} inodes={}",
                snap.free_clusters, snap.dirty_clusters, snap.free_inodes
            );
            self.mark_faulted(&reason);
            return Err(FsaError::Accounting(reason));
        }
        Ok(snap)
    }

    /// Latch the consistency fault: every later claim fails.
    pub fn mark_faulted(&self, reason: &str) {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            error!(reason, "accountant: counters inconsistent, refusing further claims");
        }
    }

    /// Approximate values without summing shards.
    #[must_use]
    pub fn snapshot_approx(&self) -> CounterSnapshot {
        CounterSnapshot {
            free_clusters: self.free.read(),
            dirty_clusters: self.dirty.read(),
            free_inodes: self.free_inodes.read(),
            root_reserved: self.root_reserved,
            reserved_clusters: self.reserved_clusters(),
        }
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reserved_clusters(&self) -> u64 {
        self.resv_clusters.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn root_reserved_clusters(&self) -> u64 {
        self.root_reserved
    }

    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    #[must_use]
    pub fn free_counter(&self) -> &ShardedCounter {
        &self.free
    }

    #[must_use]
    pub fn dirty_counter(&self) -> &ShardedCounter {
        &self.dirty
    }
}
