#![forbid(unsafe_code)]
//! Block-group free-space accounting.
//!
//! Tracks which clusters of each block group are in use, validates that
//! tracking against checksums and the group's own metadata layout, keeps
//! sharded approximate counters of free and in-flight space, and hands a
//! block allocator placement hints and space-reservation decisions.
//!
//! ## Design
//!
//! The subsystem is layered, leaf first:
//!
//! 1. **Geometry** ([`FsGeometry`]): pure block ↔ group arithmetic and
//!    per-group metadata overhead.
//! 2. **Descriptor table** ([`GroupDescTable`]): in-memory mirror of the
//!    on-disk group descriptors.
//! 3. **Bitmap cache** ([`BitmapCache`]): lazily created, validated and
//!    permanently quarantined per-group cluster bitmaps.
//! 4. **Accountant** ([`FreeSpaceAccountant`]): sharded free / dirty
//!    counters with a watermark-triggered exact path and a tiered claim
//!    policy.
//! 5. **Retry policy** ([`RetryPolicy`]) and **goal selector**
//!    ([`GoalSelector`]).
//!
//! [`FreeSpace`] wires them together for one mounted volume.
//!
//! Finding free bits inside a validated bitmap is left to the caller.

pub mod accountant;
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod counter;
pub mod gdt;
pub mod geometry;
pub mod goal;
pub mod retry;
pub mod space;

pub use accountant::{Caller, ClaimFlags, CounterSnapshot, FreeSpaceAccountant, ReservedOwners};
pub use bitmap::{
    bitmap_clear, bitmap_count_free, bitmap_find_next_zero, bitmap_get, bitmap_set,
    bitmap_set_range, mark_bitmap_end,
};
pub use cache::{
    BitmapBlock, BitmapCache, BitmapHandle, BitmapState, GroupInfo, synthesize_bitmap,
};
pub use config::AllocConfig;
pub use counter::ShardedCounter;
pub use gdt::GroupDescTable;
pub use geometry::{FLEX_SIZE_DIR_ALLOC_SCHEME, FsGeometry};
pub use goal::GoalSelector;
pub use retry::RetryPolicy;
pub use space::{AllocRequest, FreeSpace};

use fsa_error::FsaError;
use fsa_types::ParseError;

/// Lift a parse-layer error into the runtime taxonomy.
pub(crate) fn parse_error(err: ParseError) -> FsaError {
    FsaError::Parse(err.to_string())
}

/// A descriptor or bitmap that failed to decode at a known block.
pub(crate) fn corrupt_at(block: u64, err: &ParseError) -> FsaError {
    FsaError::Corruption {
        block,
        detail: err.to_string(),
    }
}
