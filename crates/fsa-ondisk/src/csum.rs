//! Metadata checksum service for group descriptors and block bitmaps.
//!
//! Callers treat the algorithm as opaque: they ask for a checksum of a
//! descriptor or bitmap and compare it with what is stored. The crc32c
//! implementation follows the `metadata_csum` layout; [`NoCsum`] accepts
//! everything and is used on volumes without that feature.

use crate::ext4::{Ext4GroupDesc, Ext4Superblock, GD_BITMAP_CSUM_HI_END, GD_CHECKSUM_OFFSET};
use fsa_types::{ParseError, read_le_u16};
use std::fmt;
use std::sync::Arc;

pub trait MetadataCsum: Send + Sync + fmt::Debug {
    /// Whether checksums are maintained at all.
    fn enabled(&self) -> bool;

    /// Checksum of a raw on-disk descriptor (its `bg_checksum` field is
    /// treated as zero).
    fn group_desc(&self, group: u32, raw: &[u8]) -> Result<u16, ParseError>;

    /// Checksum of a block bitmap as it would be stored in the descriptor.
    fn block_bitmap(&self, group: u32, bitmap: &[u8]) -> u32;

    /// Compare the stored `bg_checksum` against a fresh computation.
    fn verify_group_desc(&self, group: u32, raw: &[u8]) -> Result<bool, ParseError> {
        if !self.enabled() {
            return Ok(true);
        }
        let stored = read_le_u16(raw, GD_CHECKSUM_OFFSET)?;
        Ok(self.group_desc(group, raw)? == stored)
    }

    /// Compare the bitmap checksum held in `desc` against `bitmap`.
    fn verify_block_bitmap(&self, group: u32, desc: &Ext4GroupDesc, bitmap: &[u8]) -> bool {
        if !self.enabled() {
            return true;
        }
        let mask = self.bitmap_csum_mask();
        (self.block_bitmap(group, bitmap) & mask) == (desc.block_bitmap_csum & mask)
    }

    /// Store the checksum of `bitmap` into `desc`.
    fn stamp_block_bitmap(&self, group: u32, desc: &mut Ext4GroupDesc, bitmap: &[u8]) {
        if self.enabled() {
            desc.block_bitmap_csum = self.block_bitmap(group, bitmap) & self.bitmap_csum_mask();
        }
    }

    /// Bits of the bitmap checksum that the descriptor can hold.
    fn bitmap_csum_mask(&self) -> u32 {
        u32::MAX
    }
}

/// crc32c checksums (`metadata_csum`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32cCsum {
    seed: u32,
    desc_size: u16,
    clusters_per_group: u32,
}

impl Crc32cCsum {
    #[must_use]
    pub fn new(seed: u32, desc_size: u16, clusters_per_group: u32) -> Self {
        Self {
            seed,
            desc_size,
            clusters_per_group,
        }
    }
}

impl MetadataCsum for Crc32cCsum {
    fn enabled(&self) -> bool {
        true
    }

    #[expect(clippy::cast_possible_truncation)]
    fn group_desc(&self, group: u32, raw: &[u8]) -> Result<u16, ParseError> {
        let ds = usize::from(self.desc_size);
        if raw.len() < ds || ds < GD_CHECKSUM_OFFSET + 2 {
            return Err(ParseError::InsufficientData {
                needed: ds.max(GD_CHECKSUM_OFFSET + 2),
                offset: 0,
                actual: raw.len(),
            });
        }
        let mut csum = crc32c::crc32c_append(self.seed, &group.to_le_bytes());
        csum = crc32c::crc32c_append(csum, &raw[..GD_CHECKSUM_OFFSET]);
        csum = crc32c::crc32c_append(csum, &[0, 0]);
        let after = GD_CHECKSUM_OFFSET + 2;
        if after < ds {
            csum = crc32c::crc32c_append(csum, &raw[after..ds]);
        }
        Ok((csum & 0xFFFF) as u16)
    }

    fn block_bitmap(&self, _group: u32, bitmap: &[u8]) -> u32 {
        let len = (self.clusters_per_group / 8) as usize;
        let len = len.min(bitmap.len());
        crc32c::crc32c_append(self.seed, &bitmap[..len])
    }

    fn bitmap_csum_mask(&self) -> u32 {
        if self.desc_size >= GD_BITMAP_CSUM_HI_END {
            u32::MAX
        } else {
            0xFFFF
        }
    }
}

/// Checksums disabled: every verification passes and nothing is stamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoCsum;

impl MetadataCsum for NoCsum {
    fn enabled(&self) -> bool {
        false
    }

    fn group_desc(&self, _group: u32, _raw: &[u8]) -> Result<u16, ParseError> {
        Ok(0)
    }

    fn block_bitmap(&self, _group: u32, _bitmap: &[u8]) -> u32 {
        0
    }
}

/// Pick the checksum service a mounted volume uses.
///
/// Only `metadata_csum` is checksummed; a volume with just the legacy
/// `GDT_CSUM` (crc16) feature is treated as unchecksummed.
#[must_use]
pub fn csum_for_superblock(sb: &Ext4Superblock) -> Arc<dyn MetadataCsum> {
    if sb.has_metadata_csum() {
        Arc::new(Crc32cCsum::new(
            sb.csum_seed(),
            sb.group_desc_size(),
            sb.effective_clusters_per_group(),
        ))
    } else {
        Arc::new(NoCsum)
    }
}
