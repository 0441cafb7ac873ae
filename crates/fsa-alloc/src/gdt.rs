//! In-memory group descriptor table.
//!
//! Raw descriptor-table blocks are kept as read from disk so fields the
//! descriptor type does not model survive a rewrite. Descriptors are decoded
//! on lookup; [`GroupDescTable::update`] re-encodes, re-stamps the checksum
//! and marks the owning block dirty for the journal to persist.

use crate::geometry::FsGeometry;
use crate::{corrupt_at, parse_error};
use fsa_block::{BlockBuf, BlockDevice};
use fsa_error::{FsaError, Result};
use fsa_ondisk::ext4::GD_CHECKSUM_OFFSET;
use fsa_ondisk::{Ext4GroupDesc, MetadataCsum};
use fsa_types::{BlockNumber, GroupNumber, write_le_u16};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct GroupDescTable {
    group_count: u32,
    desc_size: u16,
    desc_per_block: u32,
    block_size: u32,
    /// On-disk location of each table block.
    locations: Vec<BlockNumber>,
    blocks: Vec<RwLock<Option<Vec<u8>>>>,
    dirty: Mutex<BTreeSet<usize>>,
    csum: Arc<dyn MetadataCsum>,
}

impl std::fmt::Debug for GroupDescTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDescTable")
            .field("group_count", &self.group_count)
            .field("desc_size", &self.desc_size)
            .field("table_blocks", &self.locations.len())
            .field("loaded", &self.loaded_blocks())
            .finish_non_exhaustive()
    }
}

impl GroupDescTable {
    /// Table with no blocks loaded yet.
    #[must_use]
    pub fn empty(geo: &FsGeometry, csum: Arc<dyn MetadataCsum>) -> Self {
        let locations = (0..geo.desc_blocks)
            .map(|nr| geo.descriptor_block(nr))
            .collect();
        Self {
            group_count: geo.group_count,
            desc_size: geo.desc_size,
            desc_per_block: geo.desc_per_block,
            block_size: geo.block_size,
            locations,
            blocks: (0..geo.desc_blocks).map(|_| RwLock::new(None)).collect(),
            dirty: Mutex::new(BTreeSet::new()),
            csum,
        }
    }

    /// Read every descriptor-table block. Reads are submitted together and
    /// then joined in order.
    pub fn load(
        dev: &dyn BlockDevice,
        geo: &FsGeometry,
        csum: Arc<dyn MetadataCsum>,
    ) -> Result<Self> {
        let table = Self::empty(geo, csum);
        let pending: Vec<_> = table
            .locations
            .iter()
            .map(|&loc| dev.submit_read(loc))
            .collect();
        for (nr, read) in pending.iter().enumerate() {
            let data = table.full_block(table.locations[nr], read.wait()?)?;
            *table.blocks[nr].write() = Some(data);
        }
        debug!(
            groups = table.group_count,
            blocks = table.locations.len(),
            "gdt: loaded descriptor table"
        );
        Ok(table)
    }

    /// Read descriptor-table block `nr` (no-op if already loaded).
    pub fn load_block(&self, dev: &dyn BlockDevice, nr: u32) -> Result<()> {
        let idx = nr as usize;
        let Some(&loc) = self.locations.get(idx) else {
            return Err(FsaError::InvalidArgument(format!(
                "descriptor block {nr} beyond table of {} blocks",
                self.locations.len()
            )));
        };
        if self.blocks[idx].read().is_some() {
            return Ok(());
        }
        let data = self.full_block(loc, dev.read_block(loc)?)?;
        let mut slot = self.blocks[idx].write();
        if slot.is_none() {
            *slot = Some(data);
            trace!(nr, block = loc.0, "gdt: loaded descriptor block");
        }
        Ok(())
    }

    /// A table block shorter or longer than the block size is a failed read.
    fn full_block(&self, loc: BlockNumber, buf: BlockBuf) -> Result<Vec<u8>> {
        let data = buf.into_inner();
        if data.len() == self.block_size as usize {
            return Ok(data);
        }
        Err(FsaError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("descriptor block {loc} returned {} bytes", data.len()),
        )))
    }

    /// Build a table from in-memory descriptors, stamping each checksum.
    /// Every block starts dirty.
    pub fn from_descriptors(
        geo: &FsGeometry,
        csum: Arc<dyn MetadataCsum>,
        descs: &[Ext4GroupDesc],
    ) -> Result<Self> {
        if descs.len() != geo.group_count as usize {
            return Err(FsaError::InvalidArgument(format!(
                "{} descriptors for {} groups",
                descs.len(),
                geo.group_count
            )));
        }
        let table = Self::empty(geo, csum);
        for slot in &table.blocks {
            *slot.write() = Some(vec![0_u8; table.block_size as usize]);
        }
        for (g, desc) in (0_u32..).zip(descs) {
            table.update(GroupNumber(g), |d| *d = desc.clone())?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    #[must_use]
    pub fn csum(&self) -> &Arc<dyn MetadataCsum> {
        &self.csum
    }

    /// Number of table blocks currently in memory.
    #[must_use]
    pub fn loaded_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.read().is_some()).count()
    }

    fn position(&self, group: GroupNumber) -> Result<(usize, usize)> {
        if group.0 >= self.group_count {
            return Err(FsaError::GroupOutOfRange {
                group: group.0,
                count: self.group_count,
            });
        }
        let nr = group.0 / self.desc_per_block;
        let offset = (group.0 % self.desc_per_block) as usize * usize::from(self.desc_size);
        Ok((nr as usize, offset))
    }

    fn not_loaded(group: GroupNumber, nr: usize) -> FsaError {
        FsaError::DescriptorNotLoaded {
            group: group.0,
            desc_block: u32::try_from(nr).unwrap_or(u32::MAX),
        }
    }

    /// Decoded descriptor of `group`.
    pub fn lookup(&self, group: GroupNumber) -> Result<Ext4GroupDesc> {
        let (nr, offset) = self.position(group)?;
        let guard = self.blocks[nr].read();
        let raw = guard.as_ref().ok_or_else(|| Self::not_loaded(group, nr))?;
        Ext4GroupDesc::parse_from_bytes(&raw[offset..], self.desc_size)
            .map_err(|err| corrupt_at(self.locations[nr].0, &err))
    }

    /// Check `group`'s stored descriptor checksum.
    pub fn verify_checksum(&self, group: GroupNumber) -> Result<bool> {
        let (nr, offset) = self.position(group)?;
        let guard = self.blocks[nr].read();
        let raw = guard.as_ref().ok_or_else(|| Self::not_loaded(group, nr))?;
        let end = offset + usize::from(self.desc_size);
        self.csum
            .verify_group_desc(group.0, &raw[offset..end])
            .map_err(parse_error)
    }

    /// Mutate `group`'s descriptor in place. The checksum is recomputed and
    /// the owning table block queued for writeback.
    pub fn update<R>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut Ext4GroupDesc) -> R,
    ) -> Result<R> {
        let (nr, offset) = self.position(group)?;
        let mut guard = self.blocks[nr].write();
        let raw = guard.as_mut().ok_or_else(|| Self::not_loaded(group, nr))?;
        let end = offset + usize::from(self.desc_size);
        let slot = &mut raw[offset..end];

        let mut desc = Ext4GroupDesc::parse_from_bytes(slot, self.desc_size)
            .map_err(|err| corrupt_at(self.locations[nr].0, &err))?;
        let out = f(&mut desc);
        desc.write_to_bytes(slot, self.desc_size)
            .map_err(parse_error)?;
        if self.csum.enabled() {
            let sum = self.csum.group_desc(group.0, slot).map_err(parse_error)?;
            write_le_u16(slot, GD_CHECKSUM_OFFSET, sum).map_err(parse_error)?;
        }
        drop(guard);

        self.dirty.lock().insert(nr);
        trace!(group = group.0, "gdt: descriptor updated");
        Ok(out)
    }

    /// Free clusters and free inodes summed over every loaded descriptor.
    #[must_use]
    pub fn free_totals(&self) -> (u64, u64) {
        (0..self.group_count)
            .filter_map(|g| self.lookup(GroupNumber(g)).ok())
            .fold((0, 0), |(clusters, inodes), d| {
                (
                    clusters + u64::from(d.free_blocks_count),
                    inodes + u64::from(d.free_inodes_count),
                )
            })
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Drain dirty table blocks as `(location, contents)` pairs.
    pub fn take_dirty(&self) -> Vec<(BlockNumber, Vec<u8>)> {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        dirty
            .into_iter()
            .filter_map(|nr| {
                let bytes = self.blocks.get(nr)?.read().clone()?;
                Some((self.locations[nr], bytes))
            })
            .collect()
    }
}
