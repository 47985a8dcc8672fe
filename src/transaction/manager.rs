//! # Transaction Manager
//!
//! BEGIN / COMMIT / ROLLBACK over a shared `PageManager`, a `LockManager`
//! and an optional WAL.
//!
//! ## Transaction Kinds
//!
//! | kind      | lock taken by `begin` |
//! |-----------|-----------------------|
//! | Deferred  | none                  |
//! | Immediate | Reserved              |
//! | Exclusive | Exclusive             |
//!
//! A deferred transaction takes Shared on its first `acquire_read_lock` and
//! Reserved on its first `acquire_write_lock`.
//!
//! ## Undo Log
//!
//! Taking a write lock starts the page manager's journal. Every page written
//! afterwards has its before-image captured once; the images become the
//! transaction's `Change` list, together with anything the caller recorded
//! with `record_change`.
//!
//! ## Commit
//!
//! ```text
//! escalate to Exclusive
//!   -> flush pending frees into the freelist
//!   -> stop the journal, collect changes
//!   -> WAL: one frame per changed page, last frame carries the page count
//!   -> WAL commit, auto-checkpoint past the threshold
//!   -> sync the database file
//!   -> empty the on-disk journal (the transaction is now permanent)
//!   -> publish the write set to the metadata store
//!   -> release the lock
//! ```
//!
//! A failed WAL append discards the frames written so far, so the log never
//! holds a partial transaction behind its last commit.
//!
//! ## Rollback
//!
//! Before-images are restored in reverse order outside the journal, then the
//! header is reloaded from disk, which truncates pages allocated by the
//! transaction and drops cached state. The database is synced before the
//! on-disk journal is emptied. Dropping an active transaction rolls it back.
//!
//! ## Metadata
//!
//! Small key/value state that does not live in pages sits in an
//! `MvccStore`. Each transaction reads it through the snapshot taken at
//! `begin`, buffers its own writes in a write set and publishes them
//! atomically on commit. Rollback throws the write set away.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, instrument, trace, warn, Level};

use super::lock_state::{HolderId, LockManager, LockState, LockType, Resource};
use crate::config::{DEFAULT_LOCK_TIMEOUT, WAL_AUTOCHECKPOINT_FRAMES};
use crate::error::StorageError;
use crate::mvcc::{CommitId, MvccStore, Snapshot};
use crate::storage::{JournalEntry, PageManager, RecoveryInfo, Wal};

pub type TxnId = HolderId;

/// Ids are unique per process so managers can share one `LockManager`.
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One undo record: a page's contents before the transaction touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub page_no: u32,
    /// `None` when the page did not exist before the transaction.
    pub old_data: Option<Vec<u8>>,
}

impl From<JournalEntry> for Change {
    fn from(entry: JournalEntry) -> Self {
        Self {
            page_no: entry.page_no,
            old_data: entry.before,
        }
    }
}

pub struct TransactionManager {
    pager: Arc<PageManager>,
    locks: Arc<dyn LockManager>,
    resource: Resource,
    lock_timeout: Duration,
    /// Live transactions and the metadata snapshot each one reads at.
    active: Mutex<HashMap<TxnId, CommitId>>,
    wal: Mutex<Option<Wal>>,
    meta: MvccStore<Vec<u8>, Vec<u8>>,
    publish_lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new(pager: Arc<PageManager>) -> Self {
        let resource = match pager.path() {
            Some(path) => Resource::from(path),
            None => Resource::new(":memory:"),
        };

        Self {
            pager,
            locks: Arc::new(LockState::new()),
            resource,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            active: Mutex::new(HashMap::new()),
            wal: Mutex::new(None),
            meta: MvccStore::new(),
            publish_lock: Mutex::new(()),
        }
    }

    /// Shares `locks` with other managers, e.g. several handles on one file.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn pager(&self) -> &Arc<PageManager> {
        &self.pager
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn begin(&self, kind: TransactionKind) -> Result<Transaction<'_>> {
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        let snapshot = {
            let _publish = self.publish_lock.lock();
            self.meta.snapshot(std::iter::empty())
        };
        self.active.lock().insert(id, snapshot.commit_id);

        let mut txn = Transaction {
            manager: self,
            id,
            kind,
            state: TransactionState::Active,
            lock: LockType::None,
            changes: Vec::new(),
            journaling: false,
            snapshot,
            write_set: SmallVec::new(),
        };

        let eager = match kind {
            TransactionKind::Deferred => Ok(()),
            TransactionKind::Immediate => txn.acquire_write_lock(),
            TransactionKind::Exclusive => txn.acquire_exclusive_lock(),
        };
        if let Err(err) = eager {
            txn.finish(TransactionState::RolledBack);
            return Err(err);
        }

        debug!(id, ?kind, "transaction started");
        Ok(txn)
    }

    pub fn commit_transaction(&self, txn: Transaction<'_>) -> Result<()> {
        txn.commit()
    }

    pub fn rollback_transaction(&self, txn: Transaction<'_>) -> Result<()> {
        txn.rollback()
    }

    /// Latest committed metadata value for `key`.
    pub fn meta(&self, key: &[u8]) -> Option<Vec<u8>> {
        let snapshot = self.meta.snapshot(std::iter::empty());
        self.meta.get(&key.to_vec(), &snapshot)
    }

    /// Metadata versions below this commit id are visible to no live
    /// transaction except as the newest version of their key.
    pub fn watermark(&self) -> CommitId {
        let current = self.meta.current_commit_id();
        self.active
            .lock()
            .values()
            .min()
            .map_or(current + 1, |oldest| oldest + 1)
    }

    /// Drops metadata versions no live transaction can see. Returns the
    /// number of versions removed.
    pub fn gc_meta(&self) -> usize {
        self.meta.gc(self.watermark())
    }

    fn publish(&self, write_set: &[(Vec<u8>, Option<Vec<u8>>)]) {
        let _publish = self.publish_lock.lock();
        for (key, value) in write_set {
            match value {
                Some(value) => self.meta.put(key.clone(), value.clone()),
                None => self.meta.delete(key.clone()),
            };
        }
    }

    /// Attaches the WAL at `path`. Frames that survived a previous run are
    /// checkpointed into the database before returning.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn enable_wal<P: AsRef<Path>>(&self, path: P) -> Result<RecoveryInfo> {
        let path = path.as_ref();
        let mut slot = self.wal.lock();
        if slot.is_some() {
            bail!("WAL is already enabled");
        }

        let mut wal = Wal::open(path, self.pager.page_size())
            .wrap_err_with(|| format!("failed to enable WAL at {:?}", path))?;
        let info = wal.recovery_info();
        if info.last_commit_frame > 0 {
            let pages = wal.checkpoint(&self.pager)?;
            debug!(pages, "replayed committed WAL frames");
        }

        *slot = Some(wal);
        Ok(info)
    }

    /// Checkpoints and detaches the WAL. A no-op when none is attached.
    pub fn disable_wal(&self) -> Result<()> {
        let Some(mut wal) = self.wal.lock().take() else {
            return Ok(());
        };
        wal.checkpoint(&self.pager)?;
        debug!("WAL disabled");
        Ok(())
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal.lock().is_some()
    }

    /// Copies committed WAL frames into the database. Returns pages applied.
    pub fn checkpoint(&self) -> Result<usize> {
        match self.wal.lock().as_mut() {
            Some(wal) => wal.checkpoint(&self.pager),
            None => Ok(0),
        }
    }

    fn log_commit(&self, pages: &BTreeSet<u32>) -> Result<()> {
        let mut guard = self.wal.lock();
        let Some(wal) = guard.as_mut() else {
            return Ok(());
        };

        let db_size = self.pager.num_pages();
        let live: Vec<u32> = pages.iter().copied().filter(|&p| p <= db_size).collect();
        if live.is_empty() {
            return Ok(());
        }

        let start = wal.last_commit_frame();
        let appended = live.iter().enumerate().try_for_each(|(i, &page_no)| {
            let page = self.pager.read_page(page_no)?;
            let commit_size = if i + 1 == live.len() { db_size } else { 0 };
            wal.write_frame(page_no, page.data(), commit_size).map(drop)
        });
        if let Err(err) = appended.and_then(|()| wal.commit()) {
            if let Err(discard) = wal.rewind(start) {
                warn!(error = %discard, "failed to discard partial WAL transaction");
            }
            return Err(err);
        }

        if wal.last_commit_frame() >= WAL_AUTOCHECKPOINT_FRAMES {
            wal.checkpoint(&self.pager)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("resource", &self.resource)
            .field("lock_timeout", &self.lock_timeout)
            .field("active", &self.active_count())
            .field("wal_enabled", &self.wal_enabled())
            .finish()
    }
}

pub struct Transaction<'m> {
    manager: &'m TransactionManager,
    id: TxnId,
    kind: TransactionKind,
    state: TransactionState,
    lock: LockType,
    changes: Vec<Change>,
    journaling: bool,
    snapshot: Snapshot,
    write_set: SmallVec<[(Vec<u8>, Option<Vec<u8>>); 8]>,
}

impl<'m> Transaction<'m> {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn lock_type(&self) -> LockType {
        self.lock
    }

    /// Undo records collected so far. Journal images are folded in when the
    /// transaction ends.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn pager(&self) -> &'m PageManager {
        &self.manager.pager
    }

    /// Metadata snapshot taken at `begin`.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Reads `key` from this transaction's write set, falling back to its
    /// snapshot.
    pub fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        if let Some((_, value)) = self.write_set.iter().rev().find(|(k, _)| k == key) {
            return Ok(value.clone());
        }
        Ok(self.manager.meta.get(&key.to_vec(), &self.snapshot))
    }

    pub fn put_meta(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.write_set.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    pub fn delete_meta(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.write_set.push((key.to_vec(), None));
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            bail!(StorageError::NoTransaction);
        }
        Ok(())
    }

    fn escalate(&mut self, lock: LockType) -> Result<()> {
        self.ensure_active()?;
        if self.lock >= lock {
            return Ok(());
        }

        let manager = self.manager;
        manager
            .locks
            .acquire(&manager.resource, self.id, lock, manager.lock_timeout)?;
        self.lock = lock;

        if lock >= LockType::Reserved && !self.journaling {
            manager.pager.begin_journal()?;
            self.journaling = true;
        }
        Ok(())
    }

    pub fn acquire_read_lock(&mut self) -> Result<()> {
        self.escalate(LockType::Shared)
    }

    pub fn acquire_write_lock(&mut self) -> Result<()> {
        self.escalate(LockType::Reserved)
    }

    pub fn acquire_exclusive_lock(&mut self) -> Result<()> {
        self.escalate(LockType::Exclusive)
    }

    /// Records an undo image for a page changed outside the page journal.
    pub fn record_change(&mut self, page_no: u32, old_data: Option<Vec<u8>>) -> Result<()> {
        self.ensure_active()?;
        self.changes.push(Change { page_no, old_data });
        Ok(())
    }

    fn collect_journal(&mut self) {
        if self.journaling {
            let entries = self.manager.pager.take_journal();
            self.changes.extend(entries.into_iter().map(Change::from));
            self.journaling = false;
        }
    }

    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let manager = self.manager;

        if self.lock >= LockType::Reserved {
            self.escalate(LockType::Exclusive)?;
            manager.pager.flush_free_list()?;
            self.collect_journal();

            let pages: BTreeSet<u32> = self.changes.iter().map(|c| c.page_no).collect();
            manager.log_commit(&pages)?;
            manager.pager.sync()?;
            manager.pager.end_journal()?;
        }

        if !self.write_set.is_empty() {
            manager.publish(&self.write_set);
            trace!(id = self.id, keys = self.write_set.len(), "published metadata");
        }

        debug!(id = self.id, changes = self.changes.len(), "transaction committed");
        self.finish(TransactionState::Committed);
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        let manager = self.manager;
        let wrote = self.journaling || !self.changes.is_empty();
        self.collect_journal();

        let result = self.restore(&manager.pager, wrote);
        self.finish(TransactionState::RolledBack);
        result?;

        debug!(id = self.id, changes = self.changes.len(), "transaction rolled back");
        Ok(())
    }

    fn restore(&self, pager: &PageManager, wrote: bool) -> Result<()> {
        for change in self.changes.iter().rev() {
            if let Some(old) = &change.old_data {
                pager
                    .restore_page(change.page_no, old)
                    .wrap_err_with(|| format!("failed to roll back page {}", change.page_no))?;
            }
        }
        if wrote {
            pager.reload_header()?;
            pager.sync()?;
            pager.end_journal()?;
        }
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) {
        if self.journaling {
            self.manager.pager.take_journal();
            self.journaling = false;
        }
        self.write_set.clear();
        self.manager.locks.release(&self.manager.resource, self.id);
        self.manager.active.lock().remove(&self.id);
        self.lock = LockType::None;
        self.state = state;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            if let Err(err) = self.rollback_inner() {
                warn!(id = self.id, error = %err, "rollback of dropped transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("lock", &self.lock)
            .field("changes", &self.changes.len())
            .field("write_set", &self.write_set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTree, Key, TreeKind};
    use crate::storage::PagerBuilder;

    fn manager() -> TransactionManager {
        let pager = PagerBuilder::new().page_size(512).open_in_memory().unwrap();
        TransactionManager::new(Arc::new(pager)).with_lock_timeout(Duration::from_millis(50))
    }

    #[test]
    fn begin_takes_lock_by_kind() {
        let tm = manager();

        let deferred = tm.begin(TransactionKind::Deferred).unwrap();
        assert_eq!(deferred.lock_type(), LockType::None);
        deferred.commit().unwrap();

        let immediate = tm.begin(TransactionKind::Immediate).unwrap();
        assert_eq!(immediate.lock_type(), LockType::Reserved);
        immediate.rollback().unwrap();

        let exclusive = tm.begin(TransactionKind::Exclusive).unwrap();
        assert_eq!(exclusive.lock_type(), LockType::Exclusive);
        assert_eq!(tm.active_count(), 1);
        exclusive.commit().unwrap();
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn deferred_escalates() {
        let tm = manager();
        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();

        txn.acquire_read_lock().unwrap();
        assert_eq!(txn.lock_type(), LockType::Shared);
        txn.acquire_write_lock().unwrap();
        assert_eq!(txn.lock_type(), LockType::Reserved);
        txn.acquire_read_lock().unwrap();
        assert_eq!(txn.lock_type(), LockType::Reserved);
        txn.commit().unwrap();
    }

    #[test]
    fn second_writer_times_out() {
        let tm = manager();
        let _writer = tm.begin(TransactionKind::Immediate).unwrap();

        let err = tm.begin(TransactionKind::Immediate).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::Locked { .. })
        ));
        assert_eq!(tm.active_count(), 1);
    }

    #[test]
    fn rollback_restores_pages() {
        let tm = manager();
        let pager = tm.pager();
        let root = {
            let txn = tm.begin(TransactionKind::Immediate).unwrap();
            let mut tree = BTree::create(pager, TreeKind::Table).unwrap();
            tree.insert(&Key::RowId(1), b"kept").unwrap();
            txn.commit().unwrap();
            tree.root_page()
        };
        let pages_before = pager.num_pages();

        let txn = tm.begin(TransactionKind::Immediate).unwrap();
        let mut tree = BTree::open(pager, root, TreeKind::Table).unwrap();
        for rowid in 2..200 {
            tree.insert(&Key::RowId(rowid), &[9u8; 40]).unwrap();
        }
        assert!(pager.num_pages() > pages_before);
        txn.rollback().unwrap();

        assert_eq!(pager.num_pages(), pages_before);
        let tree = BTree::open(pager, root, TreeKind::Table).unwrap();
        assert_eq!(tree.search(&Key::RowId(1)).unwrap().as_deref(), Some(&b"kept"[..]));
        assert_eq!(tree.search(&Key::RowId(2)).unwrap(), None);
    }

    #[test]
    fn drop_rolls_back() {
        let tm = manager();
        let pager = tm.pager();
        let pages_before = pager.num_pages();
        {
            let _txn = tm.begin(TransactionKind::Exclusive).unwrap();
            BTree::create(pager, TreeKind::Index).unwrap();
            assert_eq!(pager.num_pages(), pages_before + 1);
        }
        assert_eq!(pager.num_pages(), pages_before);
        assert_eq!(tm.active_count(), 0);
        tm.begin(TransactionKind::Exclusive).unwrap().commit().unwrap();
    }

    #[test]
    fn record_change_on_finished_transaction() {
        let tm = manager();
        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
        txn.record_change(3, None).unwrap();
        assert_eq!(txn.changes().len(), 1);

        txn.finish(TransactionState::Committed);
        let err = txn.record_change(4, None).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::NoTransaction)
        ));
    }

    #[test]
    fn meta_is_published_on_commit_only() {
        let tm = manager();

        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
        txn.put_meta(b"schema", b"v1").unwrap();
        assert_eq!(txn.get_meta(b"schema").unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(tm.meta(b"schema"), None);
        txn.commit().unwrap();
        assert_eq!(tm.meta(b"schema").as_deref(), Some(&b"v1"[..]));

        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
        txn.put_meta(b"schema", b"v2").unwrap();
        txn.delete_meta(b"schema").unwrap();
        assert_eq!(txn.get_meta(b"schema").unwrap(), None);
        txn.rollback().unwrap();
        assert_eq!(tm.meta(b"schema").as_deref(), Some(&b"v1"[..]));
    }

    #[test]
    fn meta_reads_stay_on_the_begin_snapshot() {
        let tm = manager();
        let reader = tm.begin(TransactionKind::Deferred).unwrap();

        let mut writer = tm.begin(TransactionKind::Deferred).unwrap();
        writer.put_meta(b"k", b"new").unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.get_meta(b"k").unwrap(), None);
        let later = tm.begin(TransactionKind::Deferred).unwrap();
        assert_eq!(later.get_meta(b"k").unwrap().as_deref(), Some(&b"new"[..]));
        assert!(later.snapshot().commit_id > reader.snapshot().commit_id);
    }

    #[test]
    fn gc_keeps_versions_live_snapshots_need() {
        let tm = manager();
        for value in [&b"a"[..], b"b"] {
            let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
            txn.put_meta(b"k", value).unwrap();
            txn.commit().unwrap();
        }

        let old_reader = tm.begin(TransactionKind::Deferred).unwrap();
        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
        txn.put_meta(b"k", b"c").unwrap();
        txn.commit().unwrap();

        assert_eq!(tm.watermark(), old_reader.snapshot().commit_id + 1);
        assert_eq!(tm.gc_meta(), 1);
        assert_eq!(old_reader.get_meta(b"k").unwrap().as_deref(), Some(&b"b"[..]));

        drop(old_reader);
        assert_eq!(tm.gc_meta(), 1);
        assert_eq!(tm.meta(b"k").as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn meta_on_finished_transaction_fails() {
        let tm = manager();
        let mut txn = tm.begin(TransactionKind::Deferred).unwrap();
        txn.finish(TransactionState::Committed);

        assert!(txn.put_meta(b"k", b"v").is_err());
        assert!(txn.get_meta(b"k").is_err());
    }
}
