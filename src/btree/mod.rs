//! # B-Tree Module
//!
//! Table and index B-trees stored in the classic slotted-page format.
//!
//! ## Page Layout
//!
//! ```text
//! +---------------------------+
//! | Page Header (8B / 12B)    |  type, freeblock, cell count, content start,
//! |                           |  fragmented bytes [, rightmost child]
//! +---------------------------+
//! | Cell Pointer Array        |  2 bytes per cell, in key order
//! +---------------------------+
//! | Free Space                |
//! +---------------------------+
//! | Cell Content              |  grows downward from the end of the page
//! +---------------------------+
//! ```
//!
//! ## Cell Shapes
//!
//! | Page            | Cell                                             |
//! |-----------------|--------------------------------------------------|
//! | table leaf      | varint size, varint rowid, payload [, overflow]  |
//! | table interior  | u32 left child, varint rowid                     |
//! | index leaf      | varint size, key [, overflow]                    |
//! | index interior  | u32 left child, varint size, key [, overflow]    |
//!
//! ## Module Organization
//!
//! - `key`: the `Key` enum (rowid or bytes)
//! - `node`: cell-level helpers (key extraction, bounds search)
//! - `balancer`: fill classification, leaf split, redistribute, merge
//! - `tree`: `BTree` search, insert, delete and split propagation
//! - `cursor`: `BTreeCursor` ordered traversal

pub mod balancer;
pub mod cursor;
pub mod key;
mod node;
pub mod tree;

pub use balancer::{compare_keys, MoveDirection, PageBalancer};
pub use cursor::BTreeCursor;
pub use key::Key;
pub use tree::{BTree, TreeKind};
