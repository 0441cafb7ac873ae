//! Sharded approximate counter.
//!
//! Updates land in a per-shard delta and are folded into the global value
//! once the delta reaches the batch size, so the common path touches one
//! shard and no lock. `read` returns the global value, which lags the true
//! total by at most `shards × (batch − 1)` in either direction; `sum` adds
//! every shard and is exact at the instant each shard is read.

use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

#[derive(Debug)]
pub struct ShardedCounter {
    global: AtomicI64,
    shards: Box<[AtomicI64]>,
    batch: i64,
}

impl ShardedCounter {
    /// Counter starting at `initial` with `shards` shards (at least one).
    #[must_use]
    pub fn new(initial: i64, shards: usize, batch: u32) -> Self {
        let shards = (0..shards.max(1)).map(|_| AtomicI64::new(0)).collect();
        Self {
            global: AtomicI64::new(initial),
            shards,
            batch: i64::from(batch.max(1)),
        }
    }

    /// Counter with explicit per-shard deltas.
    #[cfg(test)]
    pub(crate) fn from_parts(global: i64, shard_deltas: &[i64], batch: u32) -> Self {
        let counter = Self::new(global, shard_deltas.len(), batch);
        for (slot, &delta) in counter.shards.iter().zip(shard_deltas) {
            slot.store(delta, Ordering::Relaxed);
        }
        counter
    }

    /// Add `delta` through shard `shard` (taken modulo the shard count).
    pub fn add(&self, delta: i64, shard: usize) {
        let slot = &self.shards[shard % self.shards.len()];
        let local = slot.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta);
        if local.abs() >= self.batch {
            let folded = slot.swap(0, Ordering::AcqRel);
            self.global.fetch_add(folded, Ordering::AcqRel);
            trace!(shard, folded, "counter: folded shard");
        }
    }

    /// Apply `delta` straight to the global value.
    pub fn add_global(&self, delta: i64) {
        self.global.fetch_add(delta, Ordering::AcqRel);
    }

    /// Approximate value (global part only).
    #[must_use]
    pub fn read(&self) -> i64 {
        self.global.load(Ordering::Acquire)
    }

    /// Approximate value clamped at zero.
    #[must_use]
    pub fn read_positive(&self) -> i64 {
        self.read().max(0)
    }

    /// Global value plus every shard.
    #[must_use]
    pub fn sum(&self) -> i64 {
        self.shards
            .iter()
            .fold(self.read(), |acc, slot| acc + slot.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn sum_positive(&self) -> i64 {
        self.sum().max(0)
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn batch(&self) -> i64 {
        self.batch
    }
}
