//! Mount-time tunables for the free-space layer.

use fsa_error::{FsaError, Result};
use serde::{Deserialize, Serialize};
use std::thread;

/// Upper bound on automatically chosen counter shards.
const MAX_AUTO_SHARDS: usize = 64;

/// Tunables with their mount defaults. Every field may be omitted from a
/// serialized config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    /// Counter shards; 0 picks `min(available_parallelism, 64)`.
    pub counter_shards: usize,
    /// Per-shard delta folded into the global value once reached.
    pub counter_batch: u32,
    /// Margin below which `has_free` sums every shard. `None` derives
    /// `4 × batch × shards`.
    pub free_watermark: Option<u64>,
    /// Whether placement is finalized at writeback (goal gets no colour).
    pub delayed_alloc: bool,
    /// Owner of the root-reserved pool; defaults to `s_def_resuid`.
    pub reserved_uid: Option<u32>,
    /// Group owning the root-reserved pool; defaults to `s_def_resgid`.
    pub reserved_gid: Option<u32>,
    /// Filesystem-wide reservation in clusters; defaults to
    /// `min(total_clusters / 50, 4096)`.
    pub reserved_clusters: Option<u64>,
    pub max_retries: u32,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            counter_shards: 0,
            counter_batch: 32,
            free_watermark: None,
            delayed_alloc: true,
            reserved_uid: None,
            reserved_gid: None,
            reserved_clusters: None,
            max_retries: 3,
        }
    }
}

impl AllocConfig {
    /// Parse a JSON config; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| FsaError::InvalidArgument(format!("alloc config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.counter_batch == 0 {
            return Err(FsaError::InvalidArgument(
                "counter_batch must be non-zero".to_owned(),
            ));
        }
        if self.counter_shards > 4096 {
            return Err(FsaError::InvalidArgument(format!(
                "counter_shards {} exceeds 4096",
                self.counter_shards
            )));
        }
        Ok(())
    }

    /// Shard count after resolving the automatic setting.
    #[must_use]
    pub fn resolved_shards(&self) -> usize {
        if self.counter_shards > 0 {
            return self.counter_shards;
        }
        thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(MAX_AUTO_SHARDS)
    }

    /// Resync margin for `shards` counter shards.
    #[must_use]
    pub fn resolved_watermark(&self, shards: usize) -> u64 {
        self.free_watermark.unwrap_or_else(|| {
            let shards = u64::try_from(shards).unwrap_or(u64::MAX);
            (4 * u64::from(self.counter_batch)).saturating_mul(shards)
        })
    }

    /// Filesystem-wide reservation for a volume of `total_clusters`.
    #[must_use]
    pub fn resolved_reserved_clusters(&self, total_clusters: u64) -> u64 {
        self.reserved_clusters
            .unwrap_or_else(|| (total_clusters / 50).min(4096))
    }
}
