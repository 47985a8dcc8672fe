//! # B-Tree Integration Tests
//!
//! End-to-end behavior of table and index trees over a real page manager:
//! ordered iteration across splits, payloads that spill into overflow
//! chains, deletes that shrink the tree, and reopening a file-backed
//! database.

use std::collections::BTreeMap;

use pagestore::btree::{BTree, Key, TreeKind};
use pagestore::storage::{OverflowManager, PageManager, PagerBuilder};
use tempfile::tempdir;

fn memory_pager(page_size: usize) -> PageManager {
    PagerBuilder::new().page_size(page_size).open_in_memory().unwrap()
}

fn collect(tree: &BTree<'_>) -> Vec<(Key, Vec<u8>)> {
    let mut cursor = tree.new_cursor();
    let mut out = Vec::new();
    let mut more = cursor.first().unwrap();
    while more {
        let key = cursor.key().unwrap().unwrap();
        let value = cursor.value().unwrap().unwrap();
        out.push((key, value));
        more = cursor.next().unwrap();
    }
    out
}

mod table_tree {
    use super::*;

    #[test]
    fn small_table_lookup() {
        let pager = memory_pager(4096);
        let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();

        let rows = [(1, "Alice"), (2, "Bob"), (3, "Charlie"), (5, "Eve"), (4, "David")];
        for (rowid, name) in rows {
            tree.insert(&Key::RowId(rowid), name.as_bytes()).unwrap();
        }

        assert_eq!(tree.search(&Key::RowId(4)).unwrap().as_deref(), Some(&b"David"[..]));
        assert_eq!(tree.search(&Key::RowId(6)).unwrap(), None);

        let rowids: Vec<i64> = collect(&tree)
            .into_iter()
            .map(|(k, _)| k.as_rowid().unwrap())
            .collect();
        assert_eq!(rowids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn cursor_visits_every_row_once() {
        let pager = memory_pager(512);
        let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();
        let mut expected = BTreeMap::new();

        // Interleaved order so splits happen on both ends.
        for i in 0..3000i64 {
            let rowid = (i * 7919) % 3000;
            let value = format!("row-{:05}", rowid).into_bytes();
            tree.insert(&Key::RowId(rowid), &value).unwrap();
            expected.insert(rowid, value);
        }

        assert!(tree.depth().unwrap() >= 3);
        let rows = collect(&tree);
        assert_eq!(rows.len(), expected.len());
        for ((key, value), (rowid, want)) in rows.iter().zip(expected.iter()) {
            assert_eq!(key.as_rowid(), Some(*rowid));
            assert_eq!(value, want);
        }
    }

    #[test]
    fn negative_rowids_sort_first() {
        let pager = memory_pager(1024);
        let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();
        for rowid in [10, -3, 0, i64::MAX, i64::MIN] {
            tree.insert(&Key::RowId(rowid), b"x").unwrap();
        }

        let rowids: Vec<i64> = collect(&tree)
            .into_iter()
            .map(|(k, _)| k.as_rowid().unwrap())
            .collect();
        assert_eq!(rowids, vec![i64::MIN, -3, 0, 10, i64::MAX]);
    }

    #[test]
    fn large_payloads_round_trip_and_release_overflow() {
        let pager = memory_pager(1024);
        let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();

        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for rowid in 0..20 {
            let mut value = big.clone();
            value[0] = rowid as u8;
            tree.insert(&Key::RowId(rowid), &value).unwrap();
        }
        let pages_used = pager.num_pages();
        assert!(pages_used > 20 * (10_000 / 1024) as u32);

        for rowid in 0..20 {
            let value = tree.search(&Key::RowId(rowid)).unwrap().unwrap();
            assert_eq!(value.len(), big.len());
            assert_eq!(value[0], rowid as u8);
            assert_eq!(&value[1..], &big[1..]);
        }

        for rowid in 0..20 {
            assert!(tree.delete(&Key::RowId(rowid)).unwrap());
        }
        pager.flush_free_list().unwrap();
        assert!(pager.free_page_count().unwrap() as usize >= 20 * (10_000 / 1020));
        assert_eq!(tree.search(&Key::RowId(3)).unwrap(), None);
    }

    #[test]
    fn delete_everything_then_reuse() {
        let pager = memory_pager(512);
        let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();
        for rowid in 0..400 {
            tree.insert(&Key::RowId(rowid), &[rowid as u8; 24]).unwrap();
        }
        for rowid in (0..400).rev() {
            assert!(tree.delete(&Key::RowId(rowid)).unwrap(), "rowid {}", rowid);
        }

        assert!(collect(&tree).is_empty());
        assert_eq!(tree.depth().unwrap(), 1);
        assert!(!tree.delete(&Key::RowId(5)).unwrap());

        let grown = pager.num_pages();
        for rowid in 0..100 {
            tree.insert(&Key::RowId(rowid), &[1u8; 24]).unwrap();
        }
        assert_eq!(pager.num_pages(), grown);
        assert_eq!(collect(&tree).len(), 100);
    }
}

mod index_tree {
    use super::*;

    #[test]
    fn byte_keys_iterate_in_memcmp_order() {
        let pager = memory_pager(512);
        let mut tree = BTree::create(&pager, TreeKind::Index).unwrap();

        let mut keys: Vec<Vec<u8>> = (0..600u32)
            .map(|i| format!("user:{:x}", i.wrapping_mul(2_654_435_761)).into_bytes())
            .collect();
        for key in &keys {
            tree.insert(&Key::Bytes(key.clone()), &[]).unwrap();
        }
        keys.sort();
        keys.dedup();

        let seen: Vec<Vec<u8>> = collect(&tree)
            .into_iter()
            .map(|(k, _)| k.as_bytes().unwrap().to_vec())
            .collect();
        assert_eq!(seen, keys);
    }

    #[test]
    fn oversized_keys_use_overflow() {
        let pager = memory_pager(512);
        let mut tree = BTree::create(&pager, TreeKind::Index).unwrap();

        let long_key = |i: u8| {
            let mut key = vec![b'k'; 3000];
            key[0] = i;
            key
        };
        for i in (0..30u8).rev() {
            tree.insert(&Key::Bytes(long_key(i)), &[]).unwrap();
        }

        let overflow = OverflowManager::new(&pager);
        assert!(overflow.chunk_size() < 3000);
        for i in 0..30u8 {
            let mut cursor = tree.new_cursor();
            assert!(cursor.seek(&Key::Bytes(long_key(i))).unwrap(), "key {}", i);
        }
        assert!(tree.delete(&Key::Bytes(long_key(7))).unwrap());
        let mut cursor = tree.new_cursor();
        assert!(!cursor.seek(&Key::Bytes(long_key(7))).unwrap());
    }

    #[test]
    fn rowid_key_on_index_is_rejected() {
        let pager = memory_pager(1024);
        let mut tree = BTree::create(&pager, TreeKind::Index).unwrap();
        assert!(tree.insert(&Key::RowId(1), b"").is_err());
    }
}

mod persistence {
    use super::*;

    #[test]
    fn reopen_file_backed_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let root = {
            let pager = PagerBuilder::new().page_size(1024).open(&path).unwrap();
            let mut tree = BTree::create(&pager, TreeKind::Table).unwrap();
            for rowid in 0..300 {
                tree.insert(&Key::RowId(rowid), format!("v{}", rowid).as_bytes())
                    .unwrap();
            }
            let root = tree.root_page();
            pager.close().unwrap();
            root
        };

        // The stored page size wins over the builder's.
        let pager = PagerBuilder::new().page_size(4096).open(&path).unwrap();
        assert_eq!(pager.page_size(), 1024);

        let tree = BTree::open(&pager, root, TreeKind::Table).unwrap();
        assert_eq!(tree.search(&Key::RowId(123)).unwrap().as_deref(), Some(&b"v123"[..]));
        assert_eq!(collect(&tree).len(), 300);
        assert!(BTree::open(&pager, root, TreeKind::Index).is_err());
    }
}
