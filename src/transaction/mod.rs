//! # Transactions
//!
//! Page-level transactions over a shared [`PageManager`](crate::storage::PageManager).
//!
//! ## Lock Levels
//!
//! ```text
//! None ──> Shared ──> Reserved ──> Exclusive
//!          readers    one writer   commit in progress
//! ```
//!
//! Any number of holders may share a resource at `Shared`. `Reserved` and
//! `Exclusive` require the requester to be the only holder. A request that
//! cannot be granted waits up to the lock timeout and fails with
//! `StorageError::Locked`; a request that would close a wait-for cycle fails
//! with `StorageError::Deadlock` when the requester is the chosen victim.
//!
//! ## Module Organization
//!
//! - `lock_state`: the `LockManager` trait and its in-process implementation
//! - `manager`: `TransactionManager`, `Transaction`, WAL integration and MVCC metadata

pub mod lock_state;
pub mod manager;

pub use lock_state::{DeadlockInfo, HolderId, LockManager, LockState, LockStats, LockType, Resource};
pub use manager::{
    Change, Transaction, TransactionKind, TransactionManager, TransactionState, TxnId,
};
