//! Block group geometry: block ↔ (group, cluster offset) mapping and the
//! metadata overhead each group carries.
//!
//! Everything here is a pure function of the superblock.

use crate::parse_error;
use fsa_error::{FsaError, Result};
use fsa_ondisk::{
    Ext4CompatFeatures, Ext4GroupDesc, Ext4IncompatFeatures, Ext4RoCompatFeatures, Ext4Superblock,
};
use fsa_types::{BlockNumber, BlockSize, EXT4_SUPERBLOCK_OFFSET, GroupNumber};
use serde::{Deserialize, Serialize};

/// Flex groups at least this large keep group 0 of each flex unit for
/// directories and place regular files from the next group on.
pub const FLEX_SIZE_DIR_ALLOC_SCHEME: u32 = 4;

/// Cached filesystem geometry derived from a validated superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub block_size: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u64,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub cluster_bits: u32,
    pub group_count: u32,
    pub inodes_per_group: u32,
    /// Blocks of inode table per group.
    pub inode_table_blocks: u32,
    pub desc_size: u16,
    pub desc_per_block: u32,
    /// Blocks occupied by the full descriptor table.
    pub desc_blocks: u32,
    pub reserved_gdt_blocks: u32,
    pub first_meta_bg: u32,
    pub sparse_super: bool,
    pub sparse_super2: bool,
    pub backup_bgs: [u32; 2],
    pub meta_bg: bool,
    pub flex_bg: bool,
    pub log_groups_per_flex: u8,
    /// `log2(blocks_per_group)` when the group size is a power of two.
    group_shift: Option<u32>,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock, rejecting layouts the
    /// bitmap code cannot represent.
    pub fn from_superblock(sb: &Ext4Superblock) -> Result<Self> {
        let block_size = BlockSize::new(sb.block_size).map_err(parse_error)?.get();
        sb.validate_geometry()
            .map_err(|err| FsaError::InvalidGeometry(err.to_string()))?;

        let group_count = sb.groups_count();
        if group_count == 0 {
            return Err(FsaError::InvalidGeometry(
                "zero block groups (blocks_count too small)".to_owned(),
            ));
        }

        let desc_size = sb.group_desc_size();
        let desc_per_block = block_size / u32::from(desc_size);
        let desc_blocks = group_count.div_ceil(desc_per_block);

        let inode_table_bytes = u64::from(sb.inodes_per_group) * u64::from(sb.inode_size.max(128));
        let inode_table_blocks = u32::try_from(inode_table_bytes.div_ceil(u64::from(block_size)))
            .map_err(|_| FsaError::InvalidGeometry("inode table too large".to_owned()))?;

        let group_shift = sb
            .blocks_per_group
            .is_power_of_two()
            .then(|| sb.blocks_per_group.trailing_zeros());

        Ok(Self {
            block_size,
            blocks_count: sb.blocks_count,
            reserved_blocks_count: sb.reserved_blocks_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            clusters_per_group: sb.effective_clusters_per_group(),
            cluster_bits: sb.cluster_bits(),
            group_count,
            inodes_per_group: sb.inodes_per_group,
            inode_table_blocks,
            desc_size,
            desc_per_block,
            desc_blocks,
            reserved_gdt_blocks: u32::from(sb.reserved_gdt_blocks),
            first_meta_bg: sb.first_meta_bg,
            sparse_super: sb.has_ro_compat(Ext4RoCompatFeatures::SPARSE_SUPER),
            sparse_super2: sb.has_compat(Ext4CompatFeatures::SPARSE_SUPER2),
            backup_bgs: sb.backup_bgs,
            meta_bg: sb.has_incompat(Ext4IncompatFeatures::META_BG),
            flex_bg: sb.has_incompat(Ext4IncompatFeatures::FLEX_BG),
            log_groups_per_flex: sb.log_groups_per_flex,
            group_shift,
        })
    }

    // ── Block ↔ group mapping ────────────────────────────────────────────────

    /// Group containing `block` and the cluster offset of `block` inside it.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn locate_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let (group, within) = match self.group_shift {
            Some(shift) => (rel >> shift, rel & (u64::from(self.blocks_per_group) - 1)),
            None => (
                rel / u64::from(self.blocks_per_group),
                rel % u64::from(self.blocks_per_group),
            ),
        };
        (GroupNumber(group as u32), (within >> self.cluster_bits) as u32)
    }

    #[must_use]
    pub fn group_of(&self, block: BlockNumber) -> GroupNumber {
        self.locate_block(block).0
    }

    /// First block of `group`.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(
            u64::from(group.0) * u64::from(self.blocks_per_group)
                + u64::from(self.first_data_block),
        )
    }

    /// Whether `block` lies inside `group`.
    #[must_use]
    pub fn block_in_group(&self, block: BlockNumber, group: GroupNumber) -> bool {
        block.0 >= u64::from(self.first_data_block)
            && block.0 < self.blocks_count
            && self.group_of(block) == group
    }

    #[must_use]
    pub fn is_last_group(&self, group: GroupNumber) -> bool {
        group.0.checked_add(1) == Some(self.group_count)
    }

    /// Last addressable block of the filesystem.
    #[must_use]
    pub fn last_block(&self) -> BlockNumber {
        BlockNumber(self.blocks_count.saturating_sub(1))
    }

    /// Clusters in `group`; the last group is sized by the device block count.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn clusters_in_group(&self, group: GroupNumber) -> u32 {
        let blocks = if self.is_last_group(group) {
            self.blocks_count
                .saturating_sub(self.group_first_block(group).0)
                .min(u64::from(self.blocks_per_group)) as u32
        } else {
            self.blocks_per_group
        };
        self.blocks_to_clusters(blocks)
    }

    /// Blocks → clusters, rounding up.
    #[must_use]
    pub fn blocks_to_clusters(&self, blocks: u32) -> u32 {
        blocks.div_ceil(1 << self.cluster_bits)
    }

    /// Cluster offset of `block` within `group`, if it lies inside it.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn cluster_in_group(&self, block: BlockNumber, group: GroupNumber) -> Option<u32> {
        if !self.block_in_group(block, group) {
            return None;
        }
        let rel = block.0 - self.group_first_block(group).0;
        Some((rel >> self.cluster_bits) as u32)
    }

    /// Total clusters on the device.
    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.blocks_count >> self.cluster_bits
    }

    /// Clusters held back for the reserved uid/gid (`s_r_blocks_count`).
    #[must_use]
    pub fn root_reserved_clusters(&self) -> u64 {
        self.reserved_blocks_count >> self.cluster_bits
    }

    /// Groups per flex unit; 1 when FLEX_BG is off.
    #[must_use]
    pub fn flex_size(&self) -> u32 {
        if self.flex_bg {
            1_u32 << self.log_groups_per_flex
        } else {
            1
        }
    }

    // ── Superblock and descriptor placement ──────────────────────────────────

    /// Whether `group` holds a superblock copy (primary or backup).
    #[must_use]
    pub fn has_super(&self, group: GroupNumber) -> bool {
        let g = group.0;
        if g == 0 {
            return true;
        }
        if self.sparse_super2 {
            return g == self.backup_bgs[0] || g == self.backup_bgs[1];
        }
        if g <= 1 || !self.sparse_super {
            return true;
        }
        if g & 1 == 0 {
            return false;
        }
        is_power_of(g, 3) || is_power_of(g, 5) || is_power_of(g, 7)
    }

    /// Descriptor-table blocks (primary or backup) stored in `group`.
    #[must_use]
    pub fn num_desc_blocks(&self, group: GroupNumber) -> u32 {
        let metagroup = group.0 / self.desc_per_block;
        if !self.meta_bg || metagroup < self.first_meta_bg {
            if !self.has_super(group) {
                return 0;
            }
            return if self.meta_bg {
                self.first_meta_bg
            } else {
                self.desc_blocks
            };
        }
        let first = metagroup * self.desc_per_block;
        let last = first + self.desc_per_block - 1;
        u32::from(group.0 == first || group.0 == first + 1 || group.0 == last)
    }

    /// Clusters at the start of `group` used by the superblock copy, the
    /// descriptor table and the reserved descriptor blocks.
    #[must_use]
    pub fn base_meta_clusters(&self, group: GroupNumber) -> u32 {
        let mut blocks = u32::from(self.has_super(group));
        let before_meta = u64::from(group.0)
            < u64::from(self.first_meta_bg) * u64::from(self.desc_per_block);
        if !self.meta_bg || before_meta {
            if blocks > 0 {
                blocks += self.num_desc_blocks(group) + self.reserved_gdt_blocks;
            }
        } else {
            blocks += self.num_desc_blocks(group);
        }
        self.blocks_to_clusters(blocks)
    }

    /// On-disk location of descriptor-table block `nr`.
    #[must_use]
    pub fn descriptor_block(&self, nr: u32) -> BlockNumber {
        // The primary superblock is at byte 1024 whatever first_data_block says.
        let sb_block = EXT4_SUPERBLOCK_OFFSET as u64 / u64::from(self.block_size);
        if !self.meta_bg || nr < self.first_meta_bg {
            return BlockNumber(sb_block + u64::from(nr) + 1);
        }
        let group = GroupNumber(nr.saturating_mul(self.desc_per_block));
        let mut skip = u64::from(self.has_super(group));
        // A 1K volume starting at block 0 keeps its superblock in block 1.
        if nr == 0 && self.block_size == 1024 && self.first_data_block == 0 {
            skip += 1;
        }
        BlockNumber(self.group_first_block(group).0 + skip)
    }

    /// Descriptor-table block holding `group`'s descriptor, and the byte
    /// offset of the descriptor within it.
    #[must_use]
    pub fn descriptor_position(&self, group: GroupNumber) -> (u32, usize) {
        let nr = group.0 / self.desc_per_block;
        let offset = (group.0 % self.desc_per_block) as usize * usize::from(self.desc_size);
        (nr, offset)
    }

    // ── Overhead ─────────────────────────────────────────────────────────────

    /// Clusters of `group` occupied by metadata: base metadata plus the
    /// block bitmap, inode bitmap and inode table blocks that physically lie
    /// inside the group, each cluster counted once.
    #[must_use]
    pub fn overhead_clusters(&self, group: GroupNumber, desc: &Ext4GroupDesc) -> u32 {
        let mut num = self.base_meta_clusters(group);

        let mut block_cluster = None;
        if let Some(c) = self.cluster_in_group(BlockNumber(desc.block_bitmap), group) {
            if c == num {
                num += 1;
            } else if c > num {
                block_cluster = Some(c);
            }
        }

        let mut inode_cluster = None;
        if let Some(c) = self.cluster_in_group(BlockNumber(desc.inode_bitmap), group) {
            if c == num {
                num += 1;
            } else if c > num {
                inode_cluster = Some(c);
            }
        }

        let mut itbl_cluster = None;
        for blk in self.inode_table_range(desc) {
            let Some(c) = self.cluster_in_group(BlockNumber(blk), group) else {
                continue;
            };
            if c < num
                || Some(c) == inode_cluster
                || Some(c) == block_cluster
                || Some(c) == itbl_cluster
            {
                continue;
            }
            if c != num {
                itbl_cluster = Some(c);
            }
            num += 1;
        }

        num + u32::from(block_cluster.is_some()) + u32::from(inode_cluster.is_some())
    }

    /// Free clusters a freshly initialized `group` starts with.
    #[must_use]
    pub fn free_clusters_after_init(&self, group: GroupNumber, desc: &Ext4GroupDesc) -> u32 {
        self.clusters_in_group(group)
            .saturating_sub(self.overhead_clusters(group, desc))
    }

    /// Block numbers of the inode table described by `desc`.
    pub fn inode_table_range(&self, desc: &Ext4GroupDesc) -> std::ops::Range<u64> {
        let start = desc.inode_table;
        start..start.saturating_add(u64::from(self.inode_table_blocks))
    }
}

/// Whether `a` is a power of `b` (`b`, `b²`, …).
fn is_power_of(mut a: u32, b: u32) -> bool {
    loop {
        if a < b {
            return false;
        }
        if a == b {
            return true;
        }
        if a % b != 0 {
            return false;
        }
        a /= b;
    }
}
