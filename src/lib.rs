//! # pagestore
//!
//! An embedded storage engine for the SQLite B-Tree file format: page I/O,
//! free-page management, overflow chains, table and index B-trees, a
//! write-ahead log and page-level transactions with lock escalation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagestore::btree::{BTree, Key, TreeKind};
//! use pagestore::storage::PagerBuilder;
//! use pagestore::transaction::{TransactionKind, TransactionManager};
//! use std::sync::Arc;
//!
//! let pager = Arc::new(PagerBuilder::new().page_size(4096).open("app.db")?);
//! let tm = TransactionManager::new(Arc::clone(&pager));
//! tm.enable_wal("app.db-wal")?;
//!
//! let txn = tm.begin(TransactionKind::Immediate)?;
//! let mut tree = BTree::create(&pager, TreeKind::Table)?;
//! tree.insert(&Key::RowId(1), b"Alice")?;
//! txn.commit()?;
//!
//! assert_eq!(tree.search(&Key::RowId(1))?.as_deref(), Some(&b"Alice"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Transactions (locks, undo, WAL)     │
//! ├─────────────────────────────────────┤
//! │  B-Tree (search, insert, delete)     │
//! ├─────────────────────────────────────┤
//! │  Cells, Varints, Overflow, Freelist  │
//! ├─────────────────────────────────────┤
//! │  Page Manager (header, cache, I/O)   │
//! ├─────────────────────────────────────┤
//! │  DatabaseFile (OS file / memory)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: format constants and tuning defaults
//! - [`encoding`]: varints and cell encoding
//! - [`storage`]: files, header, pages, cache, pager, freelist, overflow, rollback journal, WAL
//! - [`btree`]: keys, balancing, trees and cursors
//! - [`transaction`]: lock manager and transaction lifecycle
//! - [`mvcc`]: generic multi-version store
//! - [`memory`]: reusable cell buffers
//! - [`error`]: typed storage errors carried inside `eyre` reports

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod encoding;
pub mod error;
pub mod memory;
pub mod mvcc;
pub mod storage;
pub mod transaction;

pub use btree::{BTree, BTreeCursor, Key, TreeKind};
pub use error::{storage_error, StorageError};
pub use storage::{PageManager, PagerBuilder};
pub use transaction::{Transaction, TransactionKind, TransactionManager};
