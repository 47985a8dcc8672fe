//! # Memory Module
//!
//! Explicitly owned buffer pools. Hot paths (cell encode/decode, payload
//! assembly) borrow scratch buffers from a pool passed in by the caller
//! rather than from hidden global state.

mod buffer_pool;

pub use buffer_pool::{CellBufferPool, PooledBuffer};
