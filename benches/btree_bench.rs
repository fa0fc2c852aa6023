use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;

use alderdb::common::types::Rid;
use alderdb::index::btree::BPlusTree;
use alderdb::storage::buffer::BufferPoolManager;

fn create_bench_tree() -> BPlusTree<i64> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(512, path).unwrap());

    std::mem::forget(temp_file);

    BPlusTree::new("bench_index", buffer_pool).unwrap()
}

fn btree_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BTree");

    for size in [1_000u64, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("insert", size), size, |b, &size| {
            b.iter_with_setup(create_bench_tree, |tree| {
                for key in 0..size as i64 {
                    tree.insert(&key, Rid::new(1, key as u32)).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("point_lookup", size), size, |b, &size| {
            let tree = create_bench_tree();
            let mut rng = StdRng::seed_from_u64(7);
            for key in 0..size as i64 {
                tree.insert(&key, Rid::new(1, key as u32)).unwrap();
            }

            b.iter(|| {
                let key = rng.gen_range(0..size as i64);
                let values = tree.get_value(&key).unwrap();
                assert_eq!(values.len(), 1);
            });
        });

        group.bench_with_input(BenchmarkId::new("full_scan", size), size, |b, &size| {
            let tree = create_bench_tree();
            for key in 0..size as i64 {
                tree.insert(&key, Rid::new(1, key as u32)).unwrap();
            }

            b.iter(|| {
                let count = tree.begin().unwrap().count();
                assert_eq!(count, size as usize);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, btree_benchmark);
criterion_main!(benches);
