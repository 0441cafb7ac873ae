#![forbid(unsafe_code)]
//! On-disk format parsing for the ext4 structures the free-space layer reads.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into the
//! superblock subset and group descriptors, serializes descriptors back, and
//! provides the metadata checksum service as an opaque trait.

pub mod csum;
pub mod ext4;

pub use csum::{Crc32cCsum, MetadataCsum, NoCsum, csum_for_superblock};
pub use ext4::{
    Ext4CompatFeatures, Ext4GroupDesc, Ext4IncompatFeatures, Ext4RoCompatFeatures, Ext4Superblock,
    GroupDescFlags,
};
