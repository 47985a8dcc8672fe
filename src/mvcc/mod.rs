//! # Multi-Version Concurrency Control
//!
//! A generic multi-version key/value store for state that is not addressed
//! by page number. Writers append versions stamped with monotonically
//! increasing commit ids; readers pick the newest version visible to their
//! snapshot and never block on writers beyond the short append lock.
//!
//! ## Lifecycle of a Key
//!
//! ```text
//! put(k, v1) ──> [c1 v1]
//! put(k, v2) ──> [c1 v1] [c2 v2]
//! delete(k)  ──> [c1 v1] [c2 v2] [c3 ×]
//! gc(c3 + 1) ──> (key removed)
//! ```
//!
//! See [`store`] for the visibility rule and garbage collection policy.

pub mod store;

pub use store::{CommitId, MvccStore, Snapshot, Version};
