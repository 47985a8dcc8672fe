//! # Version Store
//!
//! An append-only map from keys to version chains. Every `put` or `delete`
//! appends a version stamped with a fresh commit id; nothing is overwritten.
//!
//! ```text
//! key "a":  [c1 "v1"] -> [c4 "v2"] -> [c7 <deleted>]
//!            oldest                    newest
//! ```
//!
//! ## Visibility
//!
//! A reader at snapshot S sees the newest version V with
//! `V.commit_id <= S.commit_id` and `V.commit_id` not in `S.active`. A
//! deleted marker as the visible version reads as "not found".
//!
//! ## Concurrency
//!
//! Commit ids come from an `AtomicU64` and are issued without taking the map
//! lock. Appends happen under a single `parking_lot::Mutex`; a version whose
//! id was issued before a concurrent writer's is slotted into id order so
//! chains stay sorted.
//!
//! ## Garbage Collection
//!
//! `gc(keep_below)` keeps, per key, the newest version below the watermark
//! and everything newer. A key whose only remaining version is a deleted
//! marker below the watermark is dropped entirely.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::trace;

pub type CommitId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version<V> {
    pub commit_id: CommitId,
    /// `None` marks a deletion.
    pub value: Option<V>,
}

impl<V> Version<V> {
    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }
}

/// A read view: a commit-id watermark plus the ids still in flight when the
/// snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub commit_id: CommitId,
    pub active: HashSet<CommitId>,
}

impl Snapshot {
    pub fn new(commit_id: CommitId, active: impl IntoIterator<Item = CommitId>) -> Self {
        Self {
            commit_id,
            active: active.into_iter().collect(),
        }
    }

    pub fn is_visible(&self, commit_id: CommitId) -> bool {
        commit_id <= self.commit_id && !self.active.contains(&commit_id)
    }
}

pub struct MvccStore<K, V> {
    chains: Mutex<HashMap<K, Vec<Version<V>>>>,
    last_commit: AtomicU64,
}

impl<K, V> MvccStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            last_commit: AtomicU64::new(0),
        }
    }

    fn next_commit_id(&self) -> CommitId {
        self.last_commit.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_commit_id(&self) -> CommitId {
        self.last_commit.load(Ordering::SeqCst)
    }

    fn append(&self, key: K, value: Option<V>) -> CommitId {
        let commit_id = self.next_commit_id();
        let mut chains = self.chains.lock();
        let chain = chains.entry(key).or_default();
        let at = chain.partition_point(|v| v.commit_id < commit_id);
        chain.insert(at, Version { commit_id, value });
        commit_id
    }

    pub fn put(&self, key: K, value: V) -> CommitId {
        self.append(key, Some(value))
    }

    pub fn delete(&self, key: K) -> CommitId {
        self.append(key, None)
    }

    pub fn get(&self, key: &K, snapshot: &Snapshot) -> Option<V> {
        let chains = self.chains.lock();
        chains
            .get(key)?
            .iter()
            .rev()
            .find(|v| snapshot.is_visible(v.commit_id))
            .and_then(|v| v.value.clone())
    }

    /// Snapshot at the current commit id with `active` still in flight.
    pub fn snapshot(&self, active: impl IntoIterator<Item = CommitId>) -> Snapshot {
        Snapshot::new(self.current_commit_id(), active)
    }

    /// Prunes versions no snapshot at or above `keep_below` can see.
    /// Returns the number of versions removed.
    pub fn gc(&self, keep_below: CommitId) -> usize {
        let mut chains = self.chains.lock();
        let mut removed = 0;

        chains.retain(|_, chain| {
            let below = chain.partition_point(|v| v.commit_id < keep_below);
            if below > 1 {
                chain.drain(..below - 1);
                removed += below - 1;
            }

            let dead = chain.len() == 1 && chain[0].is_deleted() && chain[0].commit_id < keep_below;
            if dead {
                removed += 1;
            }
            !dead
        });

        trace!(keep_below, removed, "mvcc gc");
        removed
    }

    /// Number of keys with at least one version.
    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version_count(&self, key: &K) -> usize {
        self.chains.lock().get(key).map_or(0, Vec::len)
    }
}

impl<K, V> Default for MvccStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_between_commits_sees_older_version() {
        let store = MvccStore::new();
        let c1 = store.put("k", "v1");
        let between = store.snapshot([]);
        let c2 = store.put("k", "v2");
        let after = store.snapshot([]);

        assert!(c2 > c1);
        assert_eq!(store.get(&"k", &between), Some("v1"));
        assert_eq!(store.get(&"k", &after), Some("v2"));
    }

    #[test]
    fn active_committer_is_hidden() {
        let store = MvccStore::new();
        let c1 = store.put("k", "v1");
        store.put("k", "v2");

        let snap = Snapshot::new(c1, [c1]);
        assert_eq!(store.get(&"k", &snap), None);
    }

    #[test]
    fn deleted_marker_reads_as_missing() {
        let store = MvccStore::new();
        store.put(1u32, 10u32);
        let before = store.snapshot([]);
        store.delete(1);

        assert_eq!(store.get(&1, &before), Some(10));
        assert_eq!(store.get(&1, &store.snapshot([])), None);
        assert_eq!(store.get(&2, &store.snapshot([])), None);
    }

    #[test]
    fn gc_keeps_newest_below_watermark() {
        let store = MvccStore::new();
        store.put("k", 1);
        store.put("k", 2);
        let c3 = store.put("k", 3);
        store.put("k", 4);

        assert_eq!(store.gc(c3 + 1), 2);
        assert_eq!(store.version_count(&"k"), 2);
        assert_eq!(store.get(&"k", &Snapshot::new(c3, [])), Some(3));
    }

    #[test]
    fn gc_drops_deleted_keys() {
        let store = MvccStore::new();
        store.put("gone", 1);
        let c = store.delete("gone");
        store.put("kept", 2);

        assert_eq!(store.gc(c + 1), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&"kept", &store.snapshot([])), Some(2));
    }

    #[test]
    fn concurrent_puts_issue_unique_ids() {
        let store = Arc::new(MvccStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..100).map(|i| store.put(i % 10, t)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<CommitId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(store.current_commit_id(), 400);
        assert_eq!(store.version_count(&3), 40);
    }
}
