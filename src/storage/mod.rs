//! # Storage Module
//!
//! The page layer of the engine: a single database file of fixed-size pages
//! in the classic B-tree file format, the page cache in front of it, free
//! space and overflow management, and the write-ahead log.
//!
//! ## File Layout
//!
//! ```text
//! main.db
//! ├── page 1        100-byte database header + unused remainder
//! ├── page 2..N     B-tree, overflow and freelist pages
//!
//! main.db-wal       32-byte header + checksummed page frames
//! main.db-journal   before-images of the transaction in flight, else empty
//! ```
//!
//! ## Module Organization
//!
//! - `file`: `DatabaseFile` trait with OS and in-memory backends
//! - `headers`: the 100-byte database header
//! - `page`: page kinds, the B-tree page header and slotted-page cell ops
//! - `cache`: LRU page cache with hit/miss statistics
//! - `pager`: `PageManager`, allocation, page journal
//! - `builder`: `PagerBuilder`
//! - `journal`: on-disk rollback journal and hot-journal replay
//! - `freelist`: on-disk trunk/leaf free page list
//! - `overflow`: overflow page chains for large payloads
//! - `wal`: write-ahead log with recovery and checkpoint
//!
//! ## Thread Safety
//!
//! `PageManager` and `PageCache` are `Send + Sync`. `Page` values are owned
//! copies; mutation is serialized by the transaction layer, not here.

pub mod builder;
pub mod cache;
pub mod file;
pub mod freelist;
pub mod headers;
pub mod journal;
pub mod overflow;
pub mod page;
pub mod pager;
pub mod wal;

pub use builder::PagerBuilder;
pub use cache::{CacheStats, PageCache};
pub use file::{DatabaseFile, MemoryFile, OsFile};
pub use freelist::FreelistManager;
pub use headers::{validate_page_size, DatabaseHeader, LIBRARY_VERSION_NUMBER};
pub use journal::{HotJournal, RollbackJournal};
pub use overflow::OverflowManager;
pub use page::{BTreePageHeader, Page, PageKind};
pub use pager::{JournalEntry, PageManager};
pub use wal::{checksum as wal_checksum, RecoveryInfo, Wal, WalFrame, WalFrameHeader, WalHeader};
