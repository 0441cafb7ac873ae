//! Mount-scoped free-space state.
//!
//! [`FreeSpace`] derives the geometry, loads the descriptor table, seeds the
//! counters and owns every component for one mounted volume. The block
//! allocator asks it for a goal, claims clusters, then loads the target
//! group's bitmap before searching it.

use crate::accountant::{Caller, ClaimFlags, FreeSpaceAccountant, ReservedOwners};
use crate::cache::{BitmapCache, BitmapHandle};
use crate::config::AllocConfig;
use crate::gdt::GroupDescTable;
use crate::geometry::FsGeometry;
use crate::goal::GoalSelector;
use crate::parse_error;
use crate::retry::RetryPolicy;
use fsa_block::{BlockDevice, read_ext4_superblock_region};
use fsa_error::{FsaError, Result};
use fsa_journal::Journal;
use fsa_ondisk::{Ext4Superblock, csum_for_superblock};
use fsa_types::{BlockNumber, GroupNumber};
use std::sync::Arc;
use tracing::{debug, info};

/// One space reservation.
#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub clusters: u64,
    /// Where the caller intends to start searching.
    pub goal: BlockNumber,
    pub flags: ClaimFlags,
    pub caller: Caller,
}

#[derive(Debug)]
pub struct FreeSpace {
    geo: Arc<FsGeometry>,
    gdt: Arc<GroupDescTable>,
    cache: BitmapCache,
    accountant: Arc<FreeSpaceAccountant>,
    retry: RetryPolicy,
    goal: GoalSelector,
    config: AllocConfig,
}

impl FreeSpace {
    /// Read and verify the superblock from `dev`, then [`FreeSpace::mount`].
    pub fn open(
        dev: Arc<dyn BlockDevice>,
        journal: Option<Arc<dyn Journal>>,
        config: AllocConfig,
    ) -> Result<Self> {
        let region = read_ext4_superblock_region(dev.as_ref())?;
        let sb = Ext4Superblock::parse_superblock_region(&region).map_err(parse_error)?;
        sb.validate_checksum(&region).map_err(|err| FsaError::Corruption {
            block: 0,
            detail: err.to_string(),
        })?;
        debug!(
            blocks = sb.blocks_count,
            block_size = sb.block_size,
            "free space: superblock read"
        );
        Self::mount(dev, &sb, journal, config)
    }

    /// Bring up free-space state for the volume described by `sb`.
    pub fn mount(
        dev: Arc<dyn BlockDevice>,
        sb: &Ext4Superblock,
        journal: Option<Arc<dyn Journal>>,
        config: AllocConfig,
    ) -> Result<Self> {
        config.validate()?;
        let geo = Arc::new(FsGeometry::from_superblock(sb)?);
        if dev.block_size() != geo.block_size {
            return Err(FsaError::Format(format!(
                "device block size {} != filesystem block size {}",
                dev.block_size(),
                geo.block_size
            )));
        }
        if dev.block_count() < geo.blocks_count {
            return Err(FsaError::Format(format!(
                "device has {} blocks, filesystem needs {}",
                dev.block_count(),
                geo.blocks_count
            )));
        }

        let gdt = Arc::new(GroupDescTable::load(
            dev.as_ref(),
            &geo,
            csum_for_superblock(sb),
        )?);
        let (free_clusters, free_inodes) = gdt.free_totals();
        let owners = ReservedOwners {
            uid: config
                .reserved_uid
                .unwrap_or_else(|| u32::from(sb.def_resuid)),
            gid: config
                .reserved_gid
                .unwrap_or_else(|| u32::from(sb.def_resgid)),
        };
        let accountant = Arc::new(FreeSpaceAccountant::new(
            &geo,
            &config,
            owners,
            free_clusters,
            free_inodes,
        )?);
        let cache = BitmapCache::new(
            Arc::clone(&geo),
            Arc::clone(&gdt),
            dev,
            Arc::clone(&accountant),
        );
        let retry = RetryPolicy::new(Arc::clone(&accountant), journal, config.max_retries);
        let goal = GoalSelector::new(Arc::clone(&geo));

        info!(
            groups = geo.group_count,
            clusters = geo.total_clusters(),
            free_clusters,
            free_inodes,
            checksums = gdt.csum().enabled(),
            "free space: mounted"
        );
        Ok(Self {
            geo,
            gdt,
            cache,
            accountant,
            retry,
            goal,
            config,
        })
    }

    /// Claim `req.clusters`, consulting the retry policy on `NoSpace`.
    /// Returns how many retries it took.
    pub fn claim_with_retry(&self, req: &AllocRequest) -> Result<u32> {
        let mut retries = 0;
        loop {
            match self.accountant.claim(req.clusters, req.flags, &req.caller) {
                Ok(()) => {
                    debug!(
                        clusters = req.clusters,
                        goal = req.goal.0,
                        retries,
                        "free space: claimed"
                    );
                    return Ok(retries);
                }
                Err(FsaError::NoSpace) => {
                    if !self.retry.should_retry(&mut retries, &req.caller)? {
                        return Err(FsaError::NoSpace);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Goal for an inode in `home_group`, honouring the mount's delayed
    /// allocation setting.
    pub fn pick_goal(
        &self,
        home_group: GroupNumber,
        is_regular_file: bool,
        request_id: u64,
    ) -> Result<BlockNumber> {
        self.goal.pick_goal(
            home_group,
            is_regular_file,
            self.config.delayed_alloc,
            request_id,
        )
    }

    /// Validated bitmap of the group containing `goal`.
    pub fn bitmap_for_goal(&self, goal: BlockNumber) -> Result<BitmapHandle> {
        if goal.0 >= self.geo.blocks_count {
            return Err(FsaError::InvalidArgument(format!(
                "goal block {goal} beyond {} blocks",
                self.geo.blocks_count
            )));
        }
        self.cache.load_bitmap(self.geo.group_of(goal))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Arc<FsGeometry> {
        &self.geo
    }

    #[must_use]
    pub fn descriptors(&self) -> &Arc<GroupDescTable> {
        &self.gdt
    }

    #[must_use]
    pub fn cache(&self) -> &BitmapCache {
        &self.cache
    }

    #[must_use]
    pub fn accountant(&self) -> &Arc<FreeSpaceAccountant> {
        &self.accountant
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn goal_selector(&self) -> &GoalSelector {
        &self.goal
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{build_image, csum_superblock};
    use crate::geometry::tests::sample_superblock;
    use fsa_block::MemBlockDevice;
    use fsa_journal::MemJournal;
    use fsa_types::{EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_OFFSET};

    /// Block 0 of a 4K image: the fields `sample_superblock` sets, at their
    /// on-disk offsets.
    fn superblock_block(ro_compat: u32) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        let sb = &mut block[EXT4_SUPERBLOCK_OFFSET..];
        sb[0x00..0x04].copy_from_slice(&(8_u32 * 8_192).to_le_bytes());
        sb[0x04..0x08].copy_from_slice(&(8_u32 * 32_768).to_le_bytes());
        sb[0x08..0x0C].copy_from_slice(&13_107_u32.to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&2_u32.to_le_bytes());
        sb[0x1C..0x20].copy_from_slice(&2_u32.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&32_768_u32.to_le_bytes());
        sb[0x24..0x28].copy_from_slice(&32_768_u32.to_le_bytes());
        sb[0x28..0x2C].copy_from_slice(&8_192_u32.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&EXT4_SUPER_MAGIC.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&256_u16.to_le_bytes());
        sb[0x64..0x68].copy_from_slice(&ro_compat.to_le_bytes());
        sb[0xCE..0xD0].copy_from_slice(&63_u16.to_le_bytes());
        block
    }

    fn config() -> AllocConfig {
        AllocConfig {
            counter_shards: 2,
            counter_batch: 4,
            reserved_clusters: Some(0),
            ..AllocConfig::default()
        }
    }

    #[test]
    fn mount_seeds_counters_from_descriptors() {
        let sb = csum_superblock();
        let image = build_image(&sb, |g| g > 0);
        let fs = FreeSpace::mount(image.dev.clone(), &sb, None, config()).expect("mount");
        let expected: u64 = image
            .descs
            .iter()
            .map(|d| u64::from(d.free_blocks_count))
            .sum();
        let snap = fs.accountant().resync().expect("resync");
        assert_eq!(snap.free_clusters, i64::try_from(expected).expect("fits"));
        assert_eq!(snap.root_reserved, 13_107);
        assert_eq!(fs.cache().count_free_clusters_exact(), expected);
    }

    #[test]
    fn open_reads_superblock_from_device() {
        let sb = sample_superblock();
        let image = build_image(&sb, |g| g % 3 == 0);
        image.dev.put_block(BlockNumber(0), &superblock_block(sb.feature_ro_compat.0));

        let fs = FreeSpace::open(image.dev.clone(), None, config()).expect("open");
        assert_eq!(fs.geometry().group_count, 8);
        assert_eq!(fs.geometry().blocks_count, sb.blocks_count);
        let desc = fs.descriptors().lookup(GroupNumber(5)).expect("g5");
        assert_eq!(desc.block_bitmap, image.descs[5].block_bitmap);
        assert_eq!(desc.free_blocks_count, image.descs[5].free_blocks_count);
        assert_eq!(fs.accountant().root_reserved_clusters(), 13_107);
    }

    #[test]
    fn open_rejects_bad_superblock() {
        let sb = csum_superblock();
        let image = build_image(&sb, |_| false);

        // Nothing at block 0 yet: no magic.
        let err = FreeSpace::open(image.dev.clone(), None, config()).expect_err("no magic");
        assert!(matches!(err, FsaError::Parse(_)));

        // Checksums enabled but the stored superblock checksum is zero.
        image.dev.put_block(BlockNumber(0), &superblock_block(sb.feature_ro_compat.0));
        let err = FreeSpace::open(image.dev.clone(), None, config()).expect_err("checksum");
        assert!(matches!(err, FsaError::Corruption { block: 0, .. }));
    }

    #[test]
    fn mount_rejects_mismatched_device() {
        let sb = csum_superblock();
        let dev = Arc::new(MemBlockDevice::new(1024, 8 * 32_768));
        let err = FreeSpace::mount(dev, &sb, None, config()).expect_err("block size");
        assert!(matches!(err, FsaError::Format(_)));
    }

    #[test]
    fn claim_with_retry_succeeds_after_commit_releases_space() {
        let sb = csum_superblock();
        let image = build_image(&sb, |_| true);
        let journal = Arc::new(MemJournal::new());
        let fs = FreeSpace::mount(image.dev.clone(), &sb, Some(journal.clone()), config())
            .expect("mount");

        let acct = Arc::clone(fs.accountant());
        journal.set_release_hook(Box::new(move |n| acct.credit_freed(n, 0)));

        // Leave ten clusters above the root reserve.
        let root = Caller::root(1);
        let free = u64::try_from(fs.accountant().resync().expect("resync").free_clusters)
            .expect("positive");
        let available = free - 13_107 - 10;
        fs.accountant()
            .claim(available, ClaimFlags::NONE, &root)
            .expect("fill");
        fs.accountant().commit_claim(available, &root);

        // 100 clusters were freed by a transaction that has not committed.
        journal.pin_free(100);
        let req = AllocRequest {
            clusters: 50,
            goal: BlockNumber(0),
            flags: ClaimFlags::NONE,
            caller: Caller::user(7, 1000, 1000),
        };
        assert_eq!(fs.claim_with_retry(&req).expect("claim"), 1);
        assert_eq!(journal.commit_count(), 1);
    }

    #[test]
    fn claim_with_retry_gives_up_after_limit() {
        let sb = csum_superblock();
        let image = build_image(&sb, |_| true);
        let journal = Arc::new(MemJournal::new());
        let fs = FreeSpace::mount(image.dev.clone(), &sb, Some(journal.clone()), config())
            .expect("mount");
        let free = u64::try_from(fs.accountant().resync().expect("resync").free_clusters)
            .expect("positive");

        // Root may still dip into the reserve; the user may not.
        let req = AllocRequest {
            clusters: free - 13_107 + 1,
            goal: BlockNumber(0),
            flags: ClaimFlags::NONE,
            caller: Caller::user(3, 1000, 1000),
        };
        let err = fs.claim_with_retry(&req).expect_err("no space");
        assert!(matches!(err, FsaError::NoSpace));
        assert_eq!(journal.commit_count(), 0);

        let root_req = AllocRequest {
            caller: Caller::root(4),
            ..req
        };
        assert_eq!(fs.claim_with_retry(&root_req).expect("root"), 0);
    }

    #[test]
    fn goal_and_bitmap_lookup() {
        let sb = csum_superblock();
        let image = build_image(&sb, |g| g % 2 == 1);
        let mut cfg = config();
        cfg.delayed_alloc = false;
        let fs = FreeSpace::mount(image.dev.clone(), &sb, None, cfg).expect("mount");

        let goal = fs.pick_goal(GroupNumber(3), true, 2).expect("goal");
        assert_eq!(goal, BlockNumber(3 * 32_768 + 2 * 2_048));
        let handle = fs.bitmap_for_goal(goal).expect("bitmap");
        assert_eq!(handle.group(), GroupNumber(3));
        assert!(handle.block().is_verified());
        assert!(matches!(
            fs.bitmap_for_goal(BlockNumber(u64::MAX)),
            Err(FsaError::InvalidArgument(_))
        ));
    }
}
