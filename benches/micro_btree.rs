//! Micro benchmarks for the copy-on-write B-tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use epochtree::storage::btree::{MinMaxAggrCalc, TreeBuilder};
use epochtree::{BTree, EntryRef, GenerationHandler, TreeStore, TreeStoreOptions};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const COMMIT_EVERY: u64 = 256;

type BenchTree = BTree<u64, i64, MinMaxAggrCalc>;

fn fresh_tree() -> BenchTree {
    BenchTree::default()
}

fn loaded_tree(count: u64) -> BenchTree {
    let mut builder = TreeBuilder::with_capacity(count as usize);
    for key in 0..count {
        builder.insert(key, key as i64);
    }
    let mut tree = fresh_tree();
    tree.assign(builder);
    tree
}

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(30);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |mut tree| {
                for key in 0..INSERT_COUNT {
                    tree.insert(key, key as i64);
                }
                black_box(tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |mut tree| {
                for &key in &random_keys {
                    tree.insert(key, key as i64);
                }
                black_box(tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert_with_commits", |b| {
        b.iter_batched(
            || (fresh_tree(), GenerationHandler::new()),
            |(mut tree, handler)| {
                for (i, &key) in random_keys.iter().enumerate() {
                    tree.insert(key, key as i64);
                    if i as u64 % COMMIT_EVERY == 0 {
                        tree.commit_generation(&handler);
                    }
                }
                black_box(tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("delete_random", |b| {
        b.iter_batched(
            || loaded_tree(INSERT_COUNT),
            |mut tree| {
                for key in &random_keys {
                    tree.remove(key);
                }
                black_box(tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("bulk_build", |b| {
        b.iter(|| black_box(loaded_tree(INSERT_COUNT).root()));
    });

    let tree = loaded_tree(INSERT_COUNT);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let probes: Vec<u64> = (0..LOOKUP_SAMPLES)
        .map(|_| rng.gen_range(0..INSERT_COUNT))
        .collect();
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for key in &probes {
                hits += usize::from(tree.find(key).valid());
            }
            black_box(hits)
        });
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("full_scan", |b| {
        b.iter(|| {
            let mut itr = tree.begin();
            let mut sum = 0i64;
            while let Some((_, value)) = itr.entry() {
                sum += value;
                itr.step_forward();
            }
            black_box(sum)
        });
    });

    group.finish();
}

fn micro_tree_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/tree_store");
    group.sample_size(30);
    for &cluster_size in &[4u64, 8, 64] {
        group.throughput(Throughput::Elements(cluster_size * 256));
        group.bench_function(BenchmarkId::new("fill_clusters", cluster_size), |b| {
            b.iter_batched(
                || {
                    TreeStore::<u64, i64, MinMaxAggrCalc>::new(TreeStoreOptions::default())
                        .expect("default options are valid")
                },
                |mut store| {
                    let mut handles = vec![EntryRef::INVALID; 256];
                    for key in 0..cluster_size {
                        for handle in handles.iter_mut() {
                            store.insert(handle, key, key as i64);
                        }
                    }
                    black_box(handles)
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, micro_btree, micro_tree_store);
criterion_main!(benches);
