#![forbid(unsafe_code)]

use fsa_types::{
    BlockSize, EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_SIZE, ParseError, ensure_slice,
    ext4_block_size_from_log, read_fixed, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── ext4 feature flags ─────────────────────────────────────────────────────

/// ext4 compatible feature flags (`s_feature_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext4CompatFeatures(pub u32);

impl Ext4CompatFeatures {
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const SPARSE_SUPER2: Self = Self(0x0200);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0004, "HAS_JOURNAL"),
        (0x0010, "RESIZE_INODE"),
        (0x0200, "SPARSE_SUPER2"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 incompatible feature flags (`s_feature_incompat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext4IncompatFeatures(pub u32);

impl Ext4IncompatFeatures {
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const CSUM_SEED: Self = Self(0x2000);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0200, "FLEX_BG"),
        (0x2000, "CSUM_SEED"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// ext4 read-only compatible feature flags (`s_feature_ro_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext4RoCompatFeatures(pub u32);

impl Ext4RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const BIGALLOC: Self = Self(0x0200);
    pub const METADATA_CSUM: Self = Self(0x0400);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0010, "GDT_CSUM"),
        (0x0200, "BIGALLOC"),
        (0x0400, "METADATA_CSUM"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext4RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as a pipe-separated list of flag names, unknown bits as hex.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// The superblock fields that determine group layout, reservations and
/// metadata checksums.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext4Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub desc_size: u16,

    // ── Reservation owners ───────────────────────────────────────────────
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: Ext4CompatFeatures,
    pub feature_incompat: Ext4IncompatFeatures,
    pub feature_ro_compat: Ext4RoCompatFeatures,

    // ── Descriptor table layout ──────────────────────────────────────────
    pub reserved_gdt_blocks: u16,
    pub first_meta_bg: u32,
    pub log_groups_per_flex: u8,
    pub backup_bgs: [u32; 2],

    // ── Checksums ────────────────────────────────────────────────────────
    pub checksum_seed: u32,
    pub checksum: u32,
}

impl Ext4Superblock {
    /// Parse an ext4 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);
        let r_blocks_lo = u64::from(read_le_u32(region, 0x08)?);
        let r_blocks_hi = u64::from(read_le_u32(region, 0x154)?);
        let free_blocks_lo = u64::from(read_le_u32(region, 0x0C)?);
        let free_blocks_hi = u64::from(read_le_u32(region, 0x158)?);

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext4_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        BlockSize::new(block_size).map_err(|_| ParseError::InvalidField {
            field: "s_log_block_size",
            reason: "unsupported block size",
        })?;

        let feature_incompat = Ext4IncompatFeatures(read_le_u32(region, 0x60)?);
        let is_64bit = feature_incompat.contains(Ext4IncompatFeatures::BIT64);

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | if is_64bit { blocks_hi << 32 } else { 0 },
            reserved_blocks_count: r_blocks_lo | if is_64bit { r_blocks_hi << 32 } else { 0 },
            free_blocks_count: free_blocks_lo | if is_64bit { free_blocks_hi << 32 } else { 0 },
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            log_block_size,
            log_cluster_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            clusters_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            desc_size: read_le_u16(region, 0xFE)?,

            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,

            feature_compat: Ext4CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat,
            feature_ro_compat: Ext4RoCompatFeatures(read_le_u32(region, 0x64)?),

            reserved_gdt_blocks: read_le_u16(region, 0xCE)?,
            first_meta_bg: read_le_u32(region, 0x104)?,
            log_groups_per_flex: ensure_slice(region, 0x174, 1)?[0],
            backup_bgs: [read_le_u32(region, 0x24C)?, read_le_u32(region, 0x250)?],

            checksum_seed: read_le_u32(region, 0x270)?,
            checksum: read_le_u32(region, 0x3FC)?,
        })
    }

    #[must_use]
    pub fn has_compat(&self, mask: Ext4CompatFeatures) -> bool {
        self.feature_compat.contains(mask)
    }

    #[must_use]
    pub fn has_incompat(&self, mask: Ext4IncompatFeatures) -> bool {
        self.feature_incompat.contains(mask)
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: Ext4RoCompatFeatures) -> bool {
        self.feature_ro_compat.contains(mask)
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(Ext4IncompatFeatures::BIT64)
    }

    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// log2(blocks per cluster). Zero unless BIGALLOC is enabled.
    #[must_use]
    pub fn cluster_bits(&self) -> u32 {
        if self.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC) {
            self.log_cluster_size.saturating_sub(self.log_block_size)
        } else {
            0
        }
    }

    /// Clusters per group; equals blocks per group without BIGALLOC.
    #[must_use]
    pub fn effective_clusters_per_group(&self) -> u32 {
        if self.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC) {
            self.clusters_per_group
        } else {
            self.blocks_per_group
        }
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// Whether this superblock uses metadata checksums (crc32c).
    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.has_ro_compat(Ext4RoCompatFeatures::METADATA_CSUM)
    }

    /// Seed for all metadata checksums.
    ///
    /// `crc32c_append(seed, data)` is the kernel's `ext4_chksum`; the seed is
    /// either stored (CSUM_SEED) or derived from the volume UUID.
    #[must_use]
    pub fn csum_seed(&self) -> u32 {
        if self.has_incompat(Ext4IncompatFeatures::CSUM_SEED) {
            self.checksum_seed
        } else {
            crc32c::crc32c_append(!0u32, &self.uuid)
        }
    }

    /// Validate the superblock's own CRC32C checksum.
    pub fn validate_checksum(&self, raw_region: &[u8]) -> Result<(), ParseError> {
        if !self.has_metadata_csum() {
            return Ok(());
        }
        let body = ensure_slice(raw_region, 0, 0x3FC)?;
        if crc32c::crc32c_append(!0u32, body) != self.checksum {
            return Err(ParseError::InvalidField {
                field: "s_checksum",
                reason: "superblock CRC32C mismatch",
            });
        }
        Ok(())
    }

    /// Validate the fields the group layout is derived from.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        let bitmap_bits = self.block_size.saturating_mul(8);
        let cpg = self.effective_clusters_per_group();
        if cpg == 0 || cpg > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_clusters_per_group",
                reason: "must be in 1..=block_size * 8 (block bitmap capacity)",
            });
        }
        if self.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC) {
            if self.log_cluster_size < self.log_block_size {
                return Err(ParseError::InvalidField {
                    field: "s_log_cluster_size",
                    reason: "cluster smaller than block",
                });
            }
            if u64::from(cpg) << self.cluster_bits() != u64::from(self.blocks_per_group) {
                return Err(ParseError::InvalidField {
                    field: "s_clusters_per_group",
                    reason: "blocks_per_group != clusters_per_group << cluster_bits",
                });
            }
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.is_64bit() && self.desc_size < 64 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "64BIT feature set but desc_size < 64",
            });
        }
        if u32::from(self.group_desc_size()) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "desc_size exceeds block_size",
            });
        }
        if u64::from(self.first_data_block) >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        // mke2fs starts 1K bigalloc volumes at block 0.
        let zero_ok = self.has_ro_compat(Ext4RoCompatFeatures::BIGALLOC);
        if self.block_size == 1024
            && self.first_data_block != 1
            && !(zero_ok && self.first_data_block == 0)
        {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K block size without bigalloc",
            });
        }
        if self.block_size > 1024 && self.first_data_block != 0 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 0 for block sizes > 1K",
            });
        }
        if self.log_groups_per_flex > 31 {
            return Err(ParseError::InvalidField {
                field: "s_log_groups_per_flex",
                reason: "flex group size overflows u32",
            });
        }
        Ok(())
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Group descriptor flags (`bg_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupDescFlags(pub u16);

impl GroupDescFlags {
    pub const INODE_UNINIT: Self = Self(0x0001);
    pub const BLOCK_UNINIT: Self = Self(0x0002);
    pub const INODE_ZEROED: Self = Self(0x0004);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[must_use]
    pub fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

const GD_BLOCK_BITMAP_CSUM_LO: usize = 0x18;
const GD_BLOCK_BITMAP_CSUM_HI: usize = 0x38;
const GD_INODE_BITMAP_CSUM_LO: usize = 0x1A;
const GD_INODE_BITMAP_CSUM_HI: usize = 0x3A;

/// Offset of `bg_checksum` within a group descriptor (2 bytes).
pub const GD_CHECKSUM_OFFSET: usize = 0x1E;

/// Descriptor size at which the high halves of the bitmap checksums exist.
pub const GD_BITMAP_CSUM_HI_END: u16 = 0x3C;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub itable_unused: u32,
    pub flags: GroupDescFlags,
    pub block_bitmap_csum: u32,
    pub inode_bitmap_csum: u32,
    pub checksum: u16,
}

impl Ext4GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let ds = usize::from(desc_size);
        if ds < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        ensure_slice(bytes, 0, ds)?;

        let mut gd = Self {
            block_bitmap: u64::from(read_le_u32(bytes, 0x00)?),
            inode_bitmap: u64::from(read_le_u32(bytes, 0x04)?),
            inode_table: u64::from(read_le_u32(bytes, 0x08)?),
            free_blocks_count: u32::from(read_le_u16(bytes, 0x0C)?),
            free_inodes_count: u32::from(read_le_u16(bytes, 0x0E)?),
            used_dirs_count: u32::from(read_le_u16(bytes, 0x10)?),
            flags: GroupDescFlags(read_le_u16(bytes, 0x12)?),
            block_bitmap_csum: u32::from(read_le_u16(bytes, GD_BLOCK_BITMAP_CSUM_LO)?),
            inode_bitmap_csum: u32::from(read_le_u16(bytes, GD_INODE_BITMAP_CSUM_LO)?),
            itable_unused: u32::from(read_le_u16(bytes, 0x1C)?),
            checksum: read_le_u16(bytes, GD_CHECKSUM_OFFSET)?,
        };

        if ds >= 64 {
            gd.block_bitmap |= u64::from(read_le_u32(bytes, 0x20)?) << 32;
            gd.inode_bitmap |= u64::from(read_le_u32(bytes, 0x24)?) << 32;
            gd.inode_table |= u64::from(read_le_u32(bytes, 0x28)?) << 32;
            gd.free_blocks_count |= u32::from(read_le_u16(bytes, 0x2C)?) << 16;
            gd.free_inodes_count |= u32::from(read_le_u16(bytes, 0x2E)?) << 16;
            gd.used_dirs_count |= u32::from(read_le_u16(bytes, 0x30)?) << 16;
            gd.itable_unused |= u32::from(read_le_u16(bytes, 0x32)?) << 16;
            gd.block_bitmap_csum |= u32::from(read_le_u16(bytes, GD_BLOCK_BITMAP_CSUM_HI)?) << 16;
            gd.inode_bitmap_csum |= u32::from(read_le_u16(bytes, GD_INODE_BITMAP_CSUM_HI)?) << 16;
        }
        Ok(gd)
    }

    /// Serialize into `out[..desc_size]`, leaving fields this type does not
    /// model (exclude bitmap, padding) untouched.
    #[expect(clippy::cast_possible_truncation)]
    pub fn write_to_bytes(&self, out: &mut [u8], desc_size: u16) -> Result<(), ParseError> {
        let ds = usize::from(desc_size);
        if ds < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        ensure_slice(out, 0, ds)?;

        write_le_u32(out, 0x00, self.block_bitmap as u32)?;
        write_le_u32(out, 0x04, self.inode_bitmap as u32)?;
        write_le_u32(out, 0x08, self.inode_table as u32)?;
        write_le_u16(out, 0x0C, self.free_blocks_count as u16)?;
        write_le_u16(out, 0x0E, self.free_inodes_count as u16)?;
        write_le_u16(out, 0x10, self.used_dirs_count as u16)?;
        write_le_u16(out, 0x12, self.flags.0)?;
        write_le_u16(out, GD_BLOCK_BITMAP_CSUM_LO, self.block_bitmap_csum as u16)?;
        write_le_u16(out, GD_INODE_BITMAP_CSUM_LO, self.inode_bitmap_csum as u16)?;
        write_le_u16(out, 0x1C, self.itable_unused as u16)?;
        write_le_u16(out, GD_CHECKSUM_OFFSET, self.checksum)?;

        if ds >= 64 {
            write_le_u32(out, 0x20, (self.block_bitmap >> 32) as u32)?;
            write_le_u32(out, 0x24, (self.inode_bitmap >> 32) as u32)?;
            write_le_u32(out, 0x28, (self.inode_table >> 32) as u32)?;
            write_le_u16(out, 0x2C, (self.free_blocks_count >> 16) as u16)?;
            write_le_u16(out, 0x2E, (self.free_inodes_count >> 16) as u16)?;
            write_le_u16(out, 0x30, (self.used_dirs_count >> 16) as u16)?;
            write_le_u16(out, 0x32, (self.itable_unused >> 16) as u16)?;
            write_le_u16(out, GD_BLOCK_BITMAP_CSUM_HI, (self.block_bitmap_csum >> 16) as u16)?;
            write_le_u16(out, GD_INODE_BITMAP_CSUM_HI, (self.inode_bitmap_csum >> 16) as u16)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn block_uninit(&self) -> bool {
        self.flags.contains(GroupDescFlags::BLOCK_UNINIT)
    }

    #[must_use]
    pub fn inode_uninit(&self) -> bool {
        self.flags.contains(GroupDescFlags::INODE_UNINIT)
    }
}
