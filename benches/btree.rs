//! B-tree benchmarks: sequential and shuffled inserts, point lookups and
//! full cursor scans over an in-memory page manager.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagestore::btree::{BTree, Key, TreeKind};
use pagestore::storage::{PageManager, PagerBuilder};
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn pager() -> PageManager {
    PagerBuilder::new().page_size(4096).open_in_memory().unwrap()
}

fn populated(pager: &PageManager, count: i64) -> u32 {
    let mut tree = BTree::create(pager, TreeKind::Table).unwrap();
    for rowid in 0..count {
        let value = format!("value{:08}", rowid);
        tree.insert(&Key::RowId(rowid), value.as_bytes()).unwrap();
    }
    tree.root_page()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert");

    for count in [100i64, 1000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("sequential", count), count, |b, &count| {
            b.iter_with_setup(pager, |pager| {
                populated(&pager, count);
                pager
            });
        });

        group.bench_with_input(BenchmarkId::new("shuffled", count), count, |b, &count| {
            let mut rowids: Vec<i64> = (0..count).collect();
            rowids.shuffle(&mut rand::rngs::StdRng::seed_from_u64(42));

            b.iter_with_setup(pager, |pager| {
                let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();
                for &rowid in &rowids {
                    tree.insert(&Key::RowId(rowid), b"shuffled-payload").unwrap();
                }
                drop(tree);
                pager
            });
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_search");

    for count in [1000i64, 100_000].iter() {
        let pager = pager();
        let root = populated(&pager, *count);
        let tree = BTree::open(&pager, root, TreeKind::Table).unwrap();

        group.bench_with_input(BenchmarkId::new("hit", count), count, |b, &count| {
            let mut rowid = 0;
            b.iter(|| {
                rowid = (rowid + 7919) % count;
                black_box(tree.search(&Key::RowId(rowid)).unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("miss", count), count, |b, &count| {
            b.iter(|| black_box(tree.search(&Key::RowId(count + 1)).unwrap()));
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_scan");

    for count in [10_000i64, 100_000].iter() {
        let pager = pager();
        let root = populated(&pager, *count);
        let tree = BTree::open(&pager, root, TreeKind::Table).unwrap();

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("cursor", count), count, |b, _| {
            b.iter(|| {
                let mut cursor = tree.new_cursor();
                let mut rows = 0u64;
                let mut more = cursor.first().unwrap();
                while more {
                    black_box(cursor.value().unwrap());
                    rows += 1;
                    more = cursor.next().unwrap();
                }
                rows
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_scan);
criterion_main!(benches);
