//! Benchmark: hot paths of free-space accounting.
//!
//! Bitmap scans run on every group load, synthesis on every first touch of
//! an uninitialized group, and the sharded counter plus `has_free` on every
//! claim.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fsa_alloc::{
    AllocConfig, Caller, ClaimFlags, FreeSpaceAccountant, FsGeometry, ReservedOwners,
    ShardedCounter, bitmap_count_free, bitmap_find_next_zero, synthesize_bitmap,
};
use fsa_ondisk::{Ext4GroupDesc, Ext4RoCompatFeatures, Ext4Superblock};
use fsa_types::GroupNumber;
use std::thread;

/// 32768-bit bitmap, ~5% free in runs of 32.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    let mut pos = 100_usize;
    while pos + 32 < 32_768 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn geometry() -> FsGeometry {
    let sb = Ext4Superblock {
        blocks_count: 64 * 32_768,
        reserved_blocks_count: 64 * 1_638,
        block_size: 4096,
        log_block_size: 2,
        log_cluster_size: 2,
        blocks_per_group: 32_768,
        clusters_per_group: 32_768,
        inodes_per_group: 8_192,
        inodes_count: 64 * 8_192,
        inode_size: 256,
        desc_size: 64,
        feature_ro_compat: Ext4RoCompatFeatures::SPARSE_SUPER,
        reserved_gdt_blocks: 255,
        ..Ext4Superblock::default()
    };
    FsGeometry::from_superblock(&sb).expect("geometry")
}

fn bench_bitmap_scan(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("bitmap_scan");
    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), 32_768)));
    });
    group.bench_function("find_next_zero", |b| {
        b.iter(|| black_box(bitmap_find_next_zero(black_box(&bm), 32_768, 20_000)));
    });
    group.finish();
}

fn bench_synthesize(c: &mut Criterion) {
    let geo = geometry();
    let mut group = c.benchmark_group("synthesize_bitmap");
    for g in [0_u32, 25, 26] {
        let grp = GroupNumber(g);
        let start = geo.group_first_block(grp).0 + u64::from(geo.base_meta_clusters(grp));
        let desc = Ext4GroupDesc {
            block_bitmap: start,
            inode_bitmap: start + 1,
            inode_table: start + 2,
            ..Ext4GroupDesc::default()
        };
        group.bench_function(format!("group_{g}"), |b| {
            b.iter(|| black_box(synthesize_bitmap(&geo, grp, black_box(&desc)).expect("bitmap")));
        });
    }
    group.finish();
}

fn bench_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("sharded_counter");
    group.bench_function("add_single_thread", |b| {
        let counter = ShardedCounter::new(0, 8, 32);
        b.iter(|| counter.add(black_box(1), 3));
    });
    group.bench_function("add_8_threads", |b| {
        let counter = ShardedCounter::new(0, 8, 32);
        b.iter(|| {
            thread::scope(|s| {
                for shard in 0..8 {
                    let counter = &counter;
                    s.spawn(move || {
                        for _ in 0..1_000 {
                            counter.add(1, shard);
                        }
                    });
                }
            });
        });
    });
    group.finish();
}

fn bench_has_free(c: &mut Criterion) {
    let geo = geometry();
    let config = AllocConfig {
        counter_shards: 8,
        reserved_clusters: Some(0),
        ..AllocConfig::default()
    };
    let total = geo.total_clusters();
    let caller = Caller::user(5, 1000, 1000);
    let mut group = c.benchmark_group("has_free");

    let roomy = FreeSpaceAccountant::new(&geo, &config, ReservedOwners::default(), total / 2, 0)
        .expect("accountant");
    group.bench_function("approximate", |b| {
        b.iter(|| black_box(roomy.has_free(black_box(8), ClaimFlags::NONE, &caller)));
    });

    // Free space sits just above the root reserve: every check sums shards.
    let tight = FreeSpaceAccountant::new(
        &geo,
        &config,
        ReservedOwners::default(),
        geo.root_reserved_clusters() + 16,
        0,
    )
    .expect("accountant");
    group.bench_function("exact_near_watermark", |b| {
        b.iter(|| black_box(tight.has_free(black_box(8), ClaimFlags::NONE, &caller)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_bitmap_scan,
    bench_synthesize,
    bench_counter,
    bench_has_free
);
criterion_main!(benches);
