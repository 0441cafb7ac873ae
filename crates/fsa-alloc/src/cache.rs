//! Per-group block bitmap cache.
//!
//! A group's bitmap is absent until first touched. It is then either
//! synthesized in memory (`BLOCK_UNINIT` groups) or read asynchronously from
//! disk, validated once, and kept for the life of the mount. A group that
//! fails validation is quarantined: its free clusters leave the global
//! counter exactly once and it never becomes valid again.
//!
//! Lock order: group runtime lock, then descriptor-table block lock, then
//! bitmap buffer lock.

use crate::accountant::FreeSpaceAccountant;
use crate::bitmap::{
    bitmap_count_free, bitmap_find_next_zero, bitmap_get, bitmap_set, bitmap_set_range,
    mark_bitmap_end,
};
use crate::gdt::GroupDescTable;
use crate::geometry::FsGeometry;
use fsa_block::{BlockDevice, PendingRead};
use fsa_error::{FsaError, Result};
use fsa_ondisk::Ext4GroupDesc;
use fsa_types::{BlockNumber, GroupNumber};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

// ── Public types ────────────────────────────────────────────────────────────

/// Lifecycle of one group's bitmap within a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitmapState {
    Absent,
    /// Read in flight, or read but not yet validated.
    Loading,
    Valid,
    /// Quarantined until unmount.
    Corrupt,
}

/// Diagnostic snapshot of a group's runtime info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group: u32,
    pub state: BitmapState,
    pub free_clusters: u32,
    pub bitmap_corrupt: bool,
    pub inode_bitmap_corrupt: bool,
}

/// Cached bitmap buffer of one group.
#[derive(Debug)]
pub struct BitmapBlock {
    group: GroupNumber,
    location: BlockNumber,
    bits: RwLock<Vec<u8>>,
    uptodate: AtomicBool,
    verified: AtomicBool,
}

impl BitmapBlock {
    fn new(group: GroupNumber, location: BlockNumber, bits: Vec<u8>, uptodate: bool) -> Self {
        Self {
            group,
            location,
            bits: RwLock::new(bits),
            uptodate: AtomicBool::new(uptodate),
            verified: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn group(&self) -> GroupNumber {
        self.group
    }

    /// On-disk block the bitmap lives in.
    #[must_use]
    pub fn location(&self) -> BlockNumber {
        self.location
    }

    /// Bitmap contents.
    pub fn bits(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bits.read()
    }

    /// Mutable contents, for the allocator setting or clearing bits.
    pub fn bits_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bits.write()
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }
}

/// Reference to a group's bitmap, possibly still loading.
///
/// Cloning shares the buffer; dropping a handle never evicts it.
#[derive(Debug, Clone)]
pub struct BitmapHandle {
    block: Arc<BitmapBlock>,
    pending: Option<PendingRead>,
}

impl BitmapHandle {
    #[must_use]
    pub fn group(&self) -> GroupNumber {
        self.block.group
    }

    #[must_use]
    pub fn block(&self) -> &Arc<BitmapBlock> {
        &self.block
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        !self.block.is_uptodate()
    }
}

// ── Synthesis ───────────────────────────────────────────────────────────────

/// Build the bitmap of a never-used group: base metadata, the group's own
/// bitmaps and inode table where they lie inside the group, and every bit
/// past the group's last cluster.
pub fn synthesize_bitmap(
    geo: &FsGeometry,
    group: GroupNumber,
    desc: &Ext4GroupDesc,
) -> Result<Vec<u8>> {
    let block_size = geo.block_size as usize;
    let bit_max = geo.base_meta_clusters(group);
    if (bit_max >> 3) as usize >= block_size {
        return Err(FsaError::StructuralCorruption {
            group: group.0,
            block: desc.block_bitmap,
            detail: format!("{bit_max} base metadata clusters exceed one bitmap block"),
        });
    }

    let mut bits = vec![0_u8; block_size];
    bitmap_set_range(&mut bits, 0, bit_max);

    let own = [desc.block_bitmap, desc.inode_bitmap];
    for blk in own.into_iter().chain(geo.inode_table_range(desc)) {
        if let Some(cluster) = geo.cluster_in_group(BlockNumber(blk), group) {
            bitmap_set(&mut bits, cluster);
        }
    }

    mark_bitmap_end(
        geo.clusters_in_group(group),
        geo.block_size.saturating_mul(8),
        &mut bits,
    );
    Ok(bits)
}

// ── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GroupRuntime {
    bitmap: Option<Arc<BitmapBlock>>,
    pending: Option<PendingRead>,
    free_clusters: u32,
    free_inodes: u32,
    bitmap_corrupt: bool,
    inode_bitmap_corrupt: bool,
}

impl GroupRuntime {
    fn state(&self) -> BitmapState {
        if self.bitmap_corrupt {
            return BitmapState::Corrupt;
        }
        match &self.bitmap {
            None => BitmapState::Absent,
            Some(b) if b.is_uptodate() && b.is_verified() => BitmapState::Valid,
            Some(_) => BitmapState::Loading,
        }
    }
}

pub struct BitmapCache {
    geo: Arc<FsGeometry>,
    gdt: Arc<GroupDescTable>,
    dev: Arc<dyn BlockDevice>,
    accountant: Arc<FreeSpaceAccountant>,
    groups: Vec<Mutex<GroupRuntime>>,
}

impl fmt::Debug for BitmapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapCache")
            .field("groups", &self.groups.len())
            .field("gdt", &self.gdt)
            .finish_non_exhaustive()
    }
}

impl BitmapCache {
    /// Cache over `gdt`, seeding each group's free counts from its
    /// descriptor (zero where the descriptor block is not loaded).
    #[must_use]
    pub fn new(
        geo: Arc<FsGeometry>,
        gdt: Arc<GroupDescTable>,
        dev: Arc<dyn BlockDevice>,
        accountant: Arc<FreeSpaceAccountant>,
    ) -> Self {
        let groups = (0..geo.group_count)
            .map(|g| {
                let (free_clusters, free_inodes) = gdt
                    .lookup(GroupNumber(g))
                    .map_or((0, 0), |d| (d.free_blocks_count, d.free_inodes_count));
                Mutex::new(GroupRuntime {
                    free_clusters,
                    free_inodes,
                    ..GroupRuntime::default()
                })
            })
            .collect();
        Self {
            geo,
            gdt,
            dev,
            accountant,
            groups,
        }
    }

    fn runtime(&self, group: GroupNumber) -> Result<&Mutex<GroupRuntime>> {
        self.groups
            .get(group.0 as usize)
            .ok_or(FsaError::GroupOutOfRange {
                group: group.0,
                count: self.geo.group_count,
            })
    }

    fn quarantined(group: GroupNumber, rt: &GroupRuntime) -> FsaError {
        FsaError::StructuralCorruption {
            group: group.0,
            block: rt.bitmap.as_ref().map_or(0, |b| b.location.0),
            detail: "block bitmap previously marked corrupt".to_owned(),
        }
    }

    /// Mark the block bitmap corrupt and drop its free clusters from the
    /// global counter, once.
    fn quarantine_bitmap(&self, group: GroupNumber, rt: &mut GroupRuntime, reason: &str) {
        if rt.bitmap_corrupt {
            return;
        }
        rt.bitmap_corrupt = true;
        self.accountant
            .quarantine_clusters(u64::from(rt.free_clusters));
        error!(
            group = group.0,
            free_clusters = rt.free_clusters,
            reason,
            "bitmap: group quarantined"
        );
    }

    fn quarantine_inodes(&self, group: GroupNumber, rt: &mut GroupRuntime) {
        if rt.inode_bitmap_corrupt {
            return;
        }
        rt.inode_bitmap_corrupt = true;
        self.accountant.quarantine_inodes(u64::from(rt.free_inodes));
        error!(
            group = group.0,
            free_inodes = rt.free_inodes,
            "bitmap: inode bitmap quarantined"
        );
    }

    // ── Loading ──────────────────────────────────────────────────────────────

    /// Start loading `group`'s bitmap.
    ///
    /// Uninitialized groups are synthesized and validated before this
    /// returns; otherwise a read is submitted and the handle is Loading until
    /// [`BitmapCache::wait`].
    pub fn load_async(&self, group: GroupNumber) -> Result<BitmapHandle> {
        let mut rt = self.runtime(group)?.lock();
        if rt.bitmap_corrupt {
            return Err(Self::quarantined(group, &rt));
        }
        if let Some(block) = rt.bitmap.clone() {
            if block.is_uptodate() {
                drop(rt);
                let handle = BitmapHandle {
                    block,
                    pending: None,
                };
                self.validate(&handle)?;
                return Ok(handle);
            }
            return Ok(BitmapHandle {
                block,
                pending: rt.pending.clone(),
            });
        }

        let desc = self.gdt.lookup(group)?;
        if !self.gdt.verify_checksum(group)? {
            self.quarantine_bitmap(group, &mut rt, "bad group descriptor checksum");
            self.quarantine_inodes(group, &mut rt);
            return Err(FsaError::ChecksumMismatch {
                group: group.0,
                what: "group descriptor",
            });
        }

        let location = BlockNumber(desc.block_bitmap);
        if desc.block_uninit() {
            let bits = match synthesize_bitmap(&self.geo, group, &desc) {
                Ok(bits) => bits,
                Err(err) => {
                    self.quarantine_bitmap(group, &mut rt, "bitmap synthesis failed");
                    return Err(err);
                }
            };
            let csum = Arc::clone(self.gdt.csum());
            self.gdt
                .update(group, |d| csum.stamp_block_bitmap(group.0, d, &bits))?;
            let block = Arc::new(BitmapBlock::new(group, location, bits, true));
            rt.bitmap = Some(Arc::clone(&block));
            drop(rt);
            debug!(group = group.0, "bitmap: synthesized uninitialized group");

            let handle = BitmapHandle {
                block,
                pending: None,
            };
            self.validate(&handle)?;
            return Ok(handle);
        }

        if location.0 <= u64::from(self.geo.first_data_block)
            || location.0 >= self.geo.blocks_count
        {
            self.quarantine_bitmap(group, &mut rt, "bitmap block outside the filesystem");
            return Err(FsaError::StructuralCorruption {
                group: group.0,
                block: location.0,
                detail: "block bitmap location outside the filesystem".to_owned(),
            });
        }

        let pending = self.dev.submit_read(location);
        let block = Arc::new(BitmapBlock::new(group, location, Vec::new(), false));
        rt.bitmap = Some(Arc::clone(&block));
        rt.pending = Some(pending.clone());
        debug!(group = group.0, block = location.0, "bitmap: read submitted");
        Ok(BitmapHandle {
            block,
            pending: Some(pending),
        })
    }

    /// Block until the handle's read completes, then validate.
    ///
    /// A failed read is not cached: the group goes back to Absent and a
    /// later load re-reads it.
    pub fn wait(&self, handle: &BitmapHandle) -> Result<()> {
        let Some(pending) = &handle.pending else {
            return self.validate(handle);
        };
        let group = handle.group();
        let outcome = pending.wait().and_then(|buf| {
            let data = buf.into_inner();
            if data.len() == self.geo.block_size as usize {
                Ok(data)
            } else {
                Err(FsaError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "bitmap block {} returned {} bytes",
                        handle.block.location,
                        data.len()
                    ),
                )))
            }
        });

        let mut rt = self.runtime(group)?.lock();
        let current = rt
            .pending
            .as_ref()
            .is_some_and(|p| p.same_request(pending));
        match outcome {
            Err(err) => {
                if current {
                    rt.pending = None;
                    rt.bitmap = None;
                }
                drop(rt);
                warn!(
                    group = group.0,
                    block = handle.block.location.0,
                    error = %err,
                    "bitmap: read failed"
                );
                Err(err)
            }
            Ok(data) => {
                if !handle.block.is_uptodate() {
                    *handle.block.bits.write() = data;
                    handle.block.uptodate.store(true, Ordering::Release);
                }
                if current {
                    rt.pending = None;
                }
                drop(rt);
                self.validate(handle)
            }
        }
    }

    /// Check the bitmap checksum and, without flex_bg, that the group's own
    /// metadata clusters are marked in use. Runs once per buffer.
    pub fn validate(&self, handle: &BitmapHandle) -> Result<()> {
        let block = &handle.block;
        if block.is_verified() {
            return Ok(());
        }
        let group = block.group;
        let mut rt = self.runtime(group)?.lock();
        if rt.bitmap_corrupt {
            return Err(Self::quarantined(group, &rt));
        }
        if block.is_verified() {
            return Ok(());
        }
        if !block.is_uptodate() {
            return Err(FsaError::NotReady { group: group.0 });
        }

        let desc = self.gdt.lookup(group)?;
        let bits = block.bits.read();
        if !self
            .gdt
            .csum()
            .verify_block_bitmap(group.0, &desc, &bits)
        {
            drop(bits);
            self.quarantine_bitmap(group, &mut rt, "bad block bitmap checksum");
            return Err(FsaError::ChecksumMismatch {
                group: group.0,
                what: "block bitmap",
            });
        }
        if let Some(bad) = self.first_unmarked_metadata(group, &desc, &bits) {
            drop(bits);
            self.quarantine_bitmap(group, &mut rt, "metadata cluster marked free");
            return Err(FsaError::StructuralCorruption {
                group: group.0,
                block: bad,
                detail: "group metadata not marked in use".to_owned(),
            });
        }
        drop(bits);

        block.verified.store(true, Ordering::Release);
        Ok(())
    }

    /// First of the group's bitmap, inode bitmap or inode table blocks whose
    /// bit is clear or which lies outside the group. Skipped under flex_bg,
    /// where that metadata may live in another group.
    fn first_unmarked_metadata(
        &self,
        group: GroupNumber,
        desc: &Ext4GroupDesc,
        bits: &[u8],
    ) -> Option<u64> {
        if self.geo.flex_bg {
            return None;
        }
        for blk in [desc.block_bitmap, desc.inode_bitmap] {
            match self.geo.cluster_in_group(BlockNumber(blk), group) {
                Some(c) if bitmap_get(bits, c) => {}
                _ => return Some(blk),
            }
        }

        let table = self.geo.inode_table_range(desc);
        let last = table.end.saturating_sub(1);
        let start = self.geo.cluster_in_group(BlockNumber(table.start), group);
        let end = self.geo.cluster_in_group(BlockNumber(last), group);
        match (start, end) {
            (Some(start), Some(end)) if bitmap_find_next_zero(bits, end + 1, start) > end => None,
            _ => Some(table.start),
        }
    }

    /// Load and validate `group`'s bitmap, blocking on the read.
    pub fn load_bitmap(&self, group: GroupNumber) -> Result<BitmapHandle> {
        let handle = self.load_async(group)?;
        self.wait(&handle)?;
        Ok(handle)
    }

    /// Validated bitmap buffer of `group`.
    pub fn bitmap(&self, group: GroupNumber) -> Result<Arc<BitmapBlock>> {
        self.load_bitmap(group).map(|h| h.block)
    }

    // ── Runtime info ─────────────────────────────────────────────────────────

    pub fn state(&self, group: GroupNumber) -> Result<BitmapState> {
        Ok(self.runtime(group)?.lock().state())
    }

    pub fn group_info(&self, group: GroupNumber) -> Result<GroupInfo> {
        let rt = self.runtime(group)?.lock();
        Ok(GroupInfo {
            group: group.0,
            state: rt.state(),
            free_clusters: rt.free_clusters,
            bitmap_corrupt: rt.bitmap_corrupt,
            inode_bitmap_corrupt: rt.inode_bitmap_corrupt,
        })
    }

    /// Apply `delta` to the group's cached and on-descriptor free count.
    ///
    /// A result outside `0..=clusters_in_group` is clamped, latches the
    /// accountant's fault and returns `Accounting`.
    pub fn adjust_group_free(&self, group: GroupNumber, delta: i64) -> Result<u32> {
        let mut rt = self.runtime(group)?.lock();
        if rt.bitmap_corrupt {
            return Err(Self::quarantined(group, &rt));
        }
        let limit = i64::from(self.geo.clusters_in_group(group));
        let wanted = i64::from(rt.free_clusters).saturating_add(delta);
        let clamped = wanted.clamp(0, limit);
        let value = u32::try_from(clamped).unwrap_or(0);
        rt.free_clusters = value;
        self.gdt.update(group, |d| d.free_blocks_count = value)?;

        if clamped != wanted {
            let reason = format!(
                "group {} free count {wanted} outside 0..={limit} after delta {delta}",
                group.0
            );
            self.accountant.mark_faulted(&reason);
            return Err(FsaError::Accounting(reason));
        }
        Ok(value)
    }

    // ── Whole-volume counts ──────────────────────────────────────────────────

    /// Free clusters counted from every loadable bitmap. Quarantined and
    /// unreadable groups are skipped.
    #[must_use]
    pub fn count_free_clusters_exact(&self) -> u64 {
        let mut total = 0_u64;
        for g in 0..self.geo.group_count {
            let group = GroupNumber(g);
            match self.bitmap(group) {
                Ok(block) => {
                    let clusters = self.geo.clusters_in_group(group);
                    total += u64::from(bitmap_count_free(&block.bits(), clusters));
                }
                Err(err) => warn!(group = g, error = %err, "bitmap: skipped in exact count"),
            }
        }
        total
    }

    /// Descriptor free counts of every group not quarantined.
    #[must_use]
    pub fn count_free_from_descriptors(&self) -> u64 {
        (0..self.geo.group_count)
            .map(GroupNumber)
            .filter(|&g| self.groups[g.0 as usize].lock().state() != BitmapState::Corrupt)
            .filter_map(|g| self.gdt.lookup(g).ok())
            .map(|d| u64::from(d.free_blocks_count))
            .sum()
    }

    #[must_use]
    pub fn geometry(&self) -> &Arc<FsGeometry> {
        &self.geo
    }

    #[must_use]
    pub fn descriptors(&self) -> &Arc<GroupDescTable> {
        &self.gdt
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accountant::ReservedOwners;
    use crate::config::AllocConfig;
    use crate::geometry::tests::{packed_desc, sample_superblock};
    use fsa_block::MemBlockDevice;
    use fsa_ondisk::{
        Ext4IncompatFeatures, Ext4RoCompatFeatures, Ext4Superblock, GroupDescFlags,
        MetadataCsum, csum_for_superblock,
    };
    use std::thread;

    /// Sample layout with `metadata_csum`.
    pub(crate) fn csum_superblock() -> Ext4Superblock {
        let mut sb = sample_superblock();
        sb.feature_ro_compat = Ext4RoCompatFeatures(
            Ext4RoCompatFeatures::SPARSE_SUPER.0 | Ext4RoCompatFeatures::METADATA_CSUM.0,
        );
        sb.uuid = [0x5A; 16];
        sb
    }

    pub(crate) struct Image {
        pub(crate) dev: Arc<MemBlockDevice>,
        pub(crate) geo: Arc<FsGeometry>,
        pub(crate) csum: Arc<dyn MetadataCsum>,
        pub(crate) descs: Vec<Ext4GroupDesc>,
    }

    /// Freshly formatted image: groups selected by `uninit` are left
    /// `BLOCK_UNINIT`, the rest carry an on-disk bitmap.
    pub(crate) fn build_image(sb: &Ext4Superblock, uninit: impl Fn(u32) -> bool) -> Image {
        let geo = FsGeometry::from_superblock(sb).expect("geometry");
        let csum = csum_for_superblock(sb);
        let dev = Arc::new(MemBlockDevice::new(geo.block_size, geo.blocks_count));
        let descs: Vec<_> = (0..geo.group_count)
            .map(|g| {
                let group = GroupNumber(g);
                let mut d = packed_desc(&geo, group);
                d.free_blocks_count = geo.free_clusters_after_init(group, &d);
                if uninit(g) {
                    d.flags = GroupDescFlags::BLOCK_UNINIT;
                } else {
                    let bits = synthesize_bitmap(&geo, group, &d).expect("bitmap");
                    csum.stamp_block_bitmap(g, &mut d, &bits);
                    dev.put_block(BlockNumber(d.block_bitmap), &bits);
                }
                d
            })
            .collect();
        let table =
            GroupDescTable::from_descriptors(&geo, Arc::clone(&csum), &descs).expect("table");
        for (loc, bytes) in table.take_dirty() {
            dev.put_block(loc, &bytes);
        }
        Image {
            dev,
            geo: Arc::new(geo),
            csum,
            descs,
        }
    }

    pub(crate) fn mount_cache(image: &Image) -> (BitmapCache, Arc<FreeSpaceAccountant>) {
        let gdt = GroupDescTable::load(image.dev.as_ref(), &image.geo, Arc::clone(&image.csum))
            .expect("gdt");
        let (clusters, inodes) = gdt.free_totals();
        let config = AllocConfig {
            counter_shards: 4,
            counter_batch: 8,
            reserved_clusters: Some(0),
            ..AllocConfig::default()
        };
        let acct = Arc::new(
            FreeSpaceAccountant::new(&image.geo, &config, ReservedOwners::default(), clusters, inodes)
                .expect("accountant"),
        );
        let dev: Arc<dyn BlockDevice> = image.dev.clone();
        let cache = BitmapCache::new(
            Arc::clone(&image.geo),
            Arc::new(gdt),
            dev,
            Arc::clone(&acct),
        );
        (cache, acct)
    }

    fn corrupt_block(dev: &MemBlockDevice, block: u64, byte: usize) {
        let mut bytes = dev.block(BlockNumber(block)).expect("written");
        bytes[byte] ^= 0x01;
        dev.put_block(BlockNumber(block), &bytes);
    }

    #[test]
    fn uninit_group_is_synthesized_without_io() {
        let image = build_image(&csum_superblock(), |g| g == 3);
        let (cache, _) = mount_cache(&image);
        let reads = image.dev.reads_submitted();

        let handle = cache.load_async(GroupNumber(3)).expect("load");
        assert!(!handle.is_loading());
        assert!(handle.block().is_verified());
        assert_eq!(image.dev.reads_submitted(), reads);
        assert_eq!(cache.state(GroupNumber(3)).expect("state"), BitmapState::Valid);

        let g = GroupNumber(3);
        let free = bitmap_count_free(&handle.block().bits(), image.geo.clusters_in_group(g));
        assert_eq!(free, image.geo.free_clusters_after_init(g, &image.descs[3]));
        // base (3 is a backup group: 1 + 1 + 63) + bitmaps + itable.
        assert_eq!(image.geo.clusters_in_group(g) - free, 65 + 2 + 512);
        assert!(cache.gdt.verify_checksum(g).expect("verify"));
        assert!(cache.gdt.is_dirty());
    }

    #[test]
    fn synthesis_marks_short_last_group_tail() {
        let mut sb = csum_superblock();
        sb.blocks_count = 7 * 32_768 + 1_000;
        let image = build_image(&sb, |g| g == 7);
        let (cache, _) = mount_cache(&image);
        let block = cache.bitmap(GroupNumber(7)).expect("bitmap");
        let bits = block.bits();
        assert!(bitmap_get(&bits, 32_767));
        assert!(bitmap_get(&bits, 1_000));
        assert_eq!(
            bitmap_count_free(&bits, 32_768),
            bitmap_count_free(&bits, 1_000)
        );
    }

    /// Clusters a synthesized bitmap marks in use, ignoring the padding
    /// past the group's end.
    fn synthesized_in_use(geo: &FsGeometry, group: GroupNumber, desc: &Ext4GroupDesc) -> u32 {
        let bits = synthesize_bitmap(geo, group, desc).expect("bitmap");
        let clusters = geo.clusters_in_group(group);
        clusters - bitmap_count_free(&bits, clusters)
    }

    #[test]
    fn flex_bg_synthesis_leaves_out_metadata_stored_elsewhere() {
        let mut sb = sample_superblock();
        sb.feature_incompat = Ext4IncompatFeatures::FLEX_BG;
        sb.log_groups_per_flex = 2;
        let geo = FsGeometry::from_superblock(&sb).expect("geometry");

        // Groups 2 and 3 keep their bitmaps and inode tables in group 0.
        for g in [2_u32, 3] {
            let group = GroupNumber(g);
            let slot = u64::from(g);
            let desc = Ext4GroupDesc {
                block_bitmap: 100 + slot,
                inode_bitmap: 110 + slot,
                inode_table: 1_000 + slot * 512,
                ..Ext4GroupDesc::default()
            };
            let base = geo.base_meta_clusters(group);
            assert_eq!(synthesized_in_use(&geo, group, &desc), base, "group {g}");
            assert_eq!(geo.overhead_clusters(group, &desc), base, "group {g}");
            assert_eq!(
                geo.free_clusters_after_init(group, &desc),
                geo.clusters_in_group(group) - base
            );
        }
        // Group 2 carries no superblock backup; group 3 does.
        assert_eq!(geo.base_meta_clusters(GroupNumber(2)), 0);
        assert_eq!(geo.base_meta_clusters(GroupNumber(3)), 65);
        let empty = Ext4GroupDesc {
            block_bitmap: 100,
            inode_bitmap: 110,
            inode_table: 1_000,
            ..Ext4GroupDesc::default()
        };
        assert_eq!(
            geo.free_clusters_after_init(GroupNumber(2), &empty),
            geo.clusters_in_group(GroupNumber(2))
        );
    }

    #[test]
    fn bigalloc_synthesis_counts_shared_clusters_once() {
        let sb = Ext4Superblock {
            blocks_count: 4 * 32_768 * 16,
            block_size: 4096,
            log_block_size: 2,
            log_cluster_size: 6,
            blocks_per_group: 32_768 * 16,
            clusters_per_group: 32_768,
            inodes_per_group: 8_192,
            inode_size: 256,
            feature_ro_compat: Ext4RoCompatFeatures(
                Ext4RoCompatFeatures::SPARSE_SUPER.0 | Ext4RoCompatFeatures::BIGALLOC.0,
            ),
            ..Ext4Superblock::default()
        };
        let geo = FsGeometry::from_superblock(&sb).expect("geometry");
        assert_eq!(geo.inode_table_blocks, 512);

        // Packed: both bitmaps share cluster 0 with the superblock, and the
        // inode table spills from cluster 0 through cluster 32.
        let packed = packed_desc(&geo, GroupNumber(0));
        assert_eq!(geo.overhead_clusters(GroupNumber(0), &packed), 33);
        assert_eq!(synthesized_in_use(&geo, GroupNumber(0), &packed), 33);

        // Spread out: bitmaps in clusters 100 and 101, inode table from
        // cluster 200 (32 clusters), superblock backup in cluster 0.
        let group = GroupNumber(1);
        let first = geo.group_first_block(group).0;
        let spread = Ext4GroupDesc {
            block_bitmap: first + 100 * 16 + 3,
            inode_bitmap: first + 101 * 16,
            inode_table: first + 200 * 16,
            ..Ext4GroupDesc::default()
        };
        assert_eq!(geo.overhead_clusters(group, &spread), 35);
        assert_eq!(synthesized_in_use(&geo, group, &spread), 35);
        assert_eq!(geo.free_clusters_after_init(group, &spread), 32_768 - 35);
    }

    #[test]
    fn synthesis_rejects_oversized_base_metadata() {
        let mut geo = FsGeometry::from_superblock(&sample_superblock()).expect("geometry");
        geo.reserved_gdt_blocks = 40_000;
        let desc = packed_desc(&geo, GroupNumber(0));
        assert!(matches!(
            synthesize_bitmap(&geo, GroupNumber(0), &desc),
            Err(FsaError::StructuralCorruption { group: 0, .. })
        ));
    }

    #[test]
    fn read_path_validates_once_and_caches() {
        let image = build_image(&csum_superblock(), |_| false);
        let (cache, _) = mount_cache(&image);
        let reads = image.dev.reads_submitted();

        let first = cache.load_bitmap(GroupNumber(1)).expect("load");
        assert!(first.block().is_verified());
        let second = cache.load_bitmap(GroupNumber(1)).expect("reload");
        assert!(Arc::ptr_eq(first.block(), second.block()));
        assert_eq!(image.dev.reads_submitted(), reads + 1);
    }

    #[test]
    fn bad_descriptor_checksum_quarantines_both_bitmaps_once() {
        let image = build_image(&csum_superblock(), |_| false);
        // Group 4's free-inode count, first descriptor block.
        corrupt_block(&image.dev, image.geo.descriptor_block(0).0, 4 * 32 + 0x0E);
        let (cache, acct) = mount_cache(&image);
        let before = acct.resync().expect("resync");
        let lost = u64::from(image.descs[4].free_blocks_count);

        let err = cache.load_async(GroupNumber(4)).expect_err("bad desc");
        assert!(matches!(
            err,
            FsaError::ChecksumMismatch {
                group: 4,
                what: "group descriptor"
            }
        ));
        let again = cache.load_async(GroupNumber(4)).expect_err("quarantined");
        assert!(matches!(again, FsaError::StructuralCorruption { group: 4, .. }));

        let after = acct.resync().expect("resync");
        assert_eq!(before.free_clusters - after.free_clusters, i64::try_from(lost).expect("fits"));
        assert!(after.free_inodes < before.free_inodes);
        let info = cache.group_info(GroupNumber(4)).expect("info");
        assert_eq!(info.state, BitmapState::Corrupt);
        assert!(info.inode_bitmap_corrupt);
    }

    #[test]
    fn bad_bitmap_checksum_is_reported_and_sticky() {
        let image = build_image(&csum_superblock(), |_| false);
        corrupt_block(&image.dev, image.descs[5].block_bitmap, 3_000);
        let (cache, acct) = mount_cache(&image);
        let before = acct.resync().expect("resync").free_clusters;

        let err = cache.load_bitmap(GroupNumber(5)).expect_err("bad bitmap");
        assert!(matches!(
            err,
            FsaError::ChecksumMismatch {
                group: 5,
                what: "block bitmap"
            }
        ));
        assert!(err.is_corruption());
        assert_eq!(cache.state(GroupNumber(5)).expect("state"), BitmapState::Corrupt);
        let after = acct.resync().expect("resync").free_clusters;
        assert_eq!(before - after, i64::from(image.descs[5].free_blocks_count));
        // Other groups are unaffected.
        cache.load_bitmap(GroupNumber(6)).expect("neighbour");
    }

    #[test]
    fn cleared_inode_table_bit_is_structural_corruption() {
        let image = build_image(&sample_superblock(), |_| false);
        let itable = image.descs[1].inode_table;
        let first = image.geo.group_first_block(GroupNumber(1)).0;
        let bit = (itable + 100 - first) as usize;
        let bitmap_at = image.descs[1].block_bitmap;
        let mut bytes = image.dev.block(BlockNumber(bitmap_at)).expect("bitmap");
        bytes[bit / 8] &= !(1 << (bit % 8));
        image.dev.put_block(BlockNumber(bitmap_at), &bytes);

        let (cache, _) = mount_cache(&image);
        let err = cache.load_bitmap(GroupNumber(1)).expect_err("structural");
        assert!(matches!(
            err,
            FsaError::StructuralCorruption { group: 1, block, .. } if block == itable
        ));
    }

    #[test]
    fn flex_bg_skips_structural_check() {
        let mut sb = sample_superblock();
        sb.feature_incompat = Ext4IncompatFeatures::FLEX_BG;
        sb.log_groups_per_flex = 2;
        let image = build_image(&sb, |_| false);
        let bitmap_at = image.descs[2].block_bitmap;
        let mut bytes = image.dev.block(BlockNumber(bitmap_at)).expect("bitmap");
        bytes[0] = 0;
        image.dev.put_block(BlockNumber(bitmap_at), &bytes);

        let (cache, _) = mount_cache(&image);
        cache.load_bitmap(GroupNumber(2)).expect("flex_bg accepts");
    }

    #[test]
    fn bitmap_outside_filesystem_is_rejected() {
        let mut image = build_image(&sample_superblock(), |_| false);
        image.descs[2].block_bitmap = 0;
        let table = GroupDescTable::from_descriptors(&image.geo, Arc::clone(&image.csum), &image.descs)
            .expect("table");
        for (loc, bytes) in table.take_dirty() {
            image.dev.put_block(loc, &bytes);
        }
        let (cache, _) = mount_cache(&image);
        assert!(matches!(
            cache.load_async(GroupNumber(2)),
            Err(FsaError::StructuralCorruption { group: 2, block: 0, .. })
        ));
    }

    #[test]
    fn read_error_is_transient() {
        let image = build_image(&csum_superblock(), |_| false);
        let (cache, acct) = mount_cache(&image);
        let bitmap_at = BlockNumber(image.descs[2].block_bitmap);
        image.dev.fail_reads(bitmap_at);

        let err = cache.load_bitmap(GroupNumber(2)).expect_err("io");
        assert!(err.is_transient());
        assert_eq!(cache.state(GroupNumber(2)).expect("state"), BitmapState::Absent);
        assert!(!acct.is_faulted());

        image.dev.heal(bitmap_at);
        cache.load_bitmap(GroupNumber(2)).expect("re-read");
        assert_eq!(cache.state(GroupNumber(2)).expect("state"), BitmapState::Valid);
    }

    #[test]
    fn deferred_read_shares_one_request() {
        let image = build_image(&csum_superblock(), |_| false);
        let (cache, _) = mount_cache(&image);
        image.dev.set_deferred(true);
        let reads = image.dev.reads_submitted();

        let a = cache.load_async(GroupNumber(6)).expect("load");
        let b = cache.load_async(GroupNumber(6)).expect("load");
        assert!(a.is_loading());
        assert_eq!(image.dev.reads_submitted(), reads + 1);
        assert_eq!(cache.state(GroupNumber(6)).expect("state"), BitmapState::Loading);
        assert!(matches!(
            cache.validate(&a),
            Err(FsaError::NotReady { group: 6 })
        ));

        assert_eq!(image.dev.complete_deferred(), 1);
        cache.wait(&a).expect("wait a");
        cache.wait(&b).expect("wait b");
        assert_eq!(cache.state(GroupNumber(6)).expect("state"), BitmapState::Valid);
    }

    #[test]
    fn racing_validators_subtract_once() {
        let image = build_image(&csum_superblock(), |_| false);
        corrupt_block(&image.dev, image.descs[7].block_bitmap, 10);
        let (cache, acct) = mount_cache(&image);
        let before = acct.resync().expect("resync").free_clusters;

        thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    let err = cache.load_bitmap(GroupNumber(7)).expect_err("corrupt");
                    assert!(err.is_corruption());
                });
            }
        });
        let after = acct.resync().expect("resync").free_clusters;
        assert_eq!(before - after, i64::from(image.descs[7].free_blocks_count));
    }

    #[test]
    fn adjust_group_free_clamps_and_faults() {
        let image = build_image(&csum_superblock(), |_| false);
        let (cache, acct) = mount_cache(&image);
        let g = GroupNumber(2);
        let start = image.descs[2].free_blocks_count;

        assert_eq!(cache.adjust_group_free(g, -10).expect("adjust"), start - 10);
        assert_eq!(cache.gdt.lookup(g).expect("desc").free_blocks_count, start - 10);
        assert!(cache.gdt.verify_checksum(g).expect("verify"));

        let err = cache
            .adjust_group_free(g, -i64::from(start))
            .expect_err("underflow");
        assert!(matches!(err, FsaError::Accounting(_)));
        assert_eq!(cache.group_info(g).expect("info").free_clusters, 0);
        assert!(acct.is_faulted());
    }

    #[test]
    fn whole_volume_counts_skip_quarantined_groups() {
        let image = build_image(&csum_superblock(), |g| g % 2 == 0);
        corrupt_block(&image.dev, image.descs[3].block_bitmap, 100);
        let (cache, _) = mount_cache(&image);

        let expected: u64 = image
            .descs
            .iter()
            .enumerate()
            .filter(|(g, _)| *g != 3)
            .map(|(_, d)| u64::from(d.free_blocks_count))
            .sum();
        assert_eq!(cache.count_free_clusters_exact(), expected);
        assert_eq!(cache.count_free_from_descriptors(), expected);
        assert!(matches!(
            cache.load_async(GroupNumber(8)),
            Err(FsaError::GroupOutOfRange { group: 8, count: 8 })
        ));
    }
}
