//! Placement hints for new allocations.

use crate::geometry::{FLEX_SIZE_DIR_ALLOC_SCHEME, FsGeometry};
use fsa_error::{FsaError, Result};
use fsa_types::{BlockNumber, GroupNumber};
use std::sync::Arc;
use tracing::trace;

/// Colour slots a group is divided into.
const COLOUR_SLOTS: u64 = 16;

#[derive(Debug, Clone)]
pub struct GoalSelector {
    geo: Arc<FsGeometry>,
}

impl GoalSelector {
    #[must_use]
    pub fn new(geo: Arc<FsGeometry>) -> Self {
        Self { geo }
    }

    /// Goal block for a new allocation on behalf of an inode living in
    /// `home_group`.
    ///
    /// With flex groups of at least [`FLEX_SIZE_DIR_ALLOC_SCHEME`], the
    /// first group of each flex unit is kept for directories and regular
    /// files start one group later. If that would step past the last group
    /// (the volume ends right after a flex unit's first group) the file goal
    /// stays in the last group. Without delayed allocation the goal is
    /// offset into the group by `request_id`, one sixteenth of the group
    /// per colour.
    pub fn pick_goal(
        &self,
        home_group: GroupNumber,
        is_regular_file: bool,
        delayed_alloc: bool,
        request_id: u64,
    ) -> Result<BlockNumber> {
        let geo = &self.geo;
        if home_group.0 >= geo.group_count {
            return Err(FsaError::GroupOutOfRange {
                group: home_group.0,
                count: geo.group_count,
            });
        }

        let mut group = home_group.0;
        let flex_size = geo.flex_size();
        if flex_size >= FLEX_SIZE_DIR_ALLOC_SCHEME {
            group &= !(flex_size - 1);
            if is_regular_file {
                group += 1;
            }
            group = group.min(geo.group_count - 1);
        }

        let bg_start = geo.group_first_block(GroupNumber(group));
        if delayed_alloc {
            return Ok(bg_start);
        }

        let colour = request_id % COLOUR_SLOTS;
        let bpg = u64::from(geo.blocks_per_group);
        let last = geo.last_block().0;
        let span = if bg_start.0 + bpg <= last {
            bpg
        } else {
            last.saturating_sub(bg_start.0)
        };
        let goal = BlockNumber(bg_start.0 + colour * (span / COLOUR_SLOTS));
        trace!(group, colour, goal = goal.0, "goal: picked");
        Ok(goal)
    }
}
