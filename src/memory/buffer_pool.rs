//! # Cell Buffer Pool
//!
//! Reusable byte buffers for cell encoding and payload assembly.
//!
//! ## Purpose
//!
//! Every insert encodes at least one cell, and splits re-encode dividers.
//! Taking those scratch buffers from a pool avoids a heap allocation per
//! cell once the pool is warm.
//!
//! ## Ownership
//!
//! A pool is an ordinary value. Each `BTree` owns one and passes it by
//! reference into the encode paths; there is no process-wide pool. Clones
//! share the same underlying buffers.
//!
//! ```ignore
//! let pool = CellBufferPool::new(8);
//!
//! let mut buf = pool.acquire();
//! encode_table_leaf_cell(&cell, usable, &mut buf)?;
//! page.insert_cell(idx, &buf)?;
//!
//! // Buffer is cleared and returned to the pool when dropped
//! drop(buf);
//! ```

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffers larger than this are dropped instead of being kept in the pool.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

pub struct CellBufferPool {
    inner: Arc<CellBufferPoolInner>,
}

struct CellBufferPoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    limit: usize,
}

impl CellBufferPool {
    /// Create a pool holding `capacity` pre-allocated buffers. At most
    /// `capacity` buffers are retained after use.
    pub fn new(capacity: usize) -> Self {
        let buffers = (0..capacity).map(|_| Vec::with_capacity(256)).collect();

        Self {
            inner: Arc::new(CellBufferPoolInner {
                buffers: Mutex::new(buffers),
                limit: capacity,
            }),
        }
    }

    /// Take an empty buffer, allocating a fresh one if the pool is drained.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self.inner.buffers.lock().pop().unwrap_or_default();

        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Clone for CellBufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for CellBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellBufferPool")
            .field("available", &self.available())
            .field("limit", &self.inner.limit)
            .finish()
    }
}

/// A buffer that returns to its pool when dropped.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<CellBufferPoolInner>,
}

impl PooledBuffer {
    /// Moves the contents out, leaving the (empty) buffer to return to the pool.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        if buffer.capacity() == 0 || buffer.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buffer.clear();

        let mut buffers = self.pool.buffers.lock();
        if buffers.len() < self.pool.limit {
            buffers.push(buffer);
        }
    }
}
