//! # Configuration Constants
//!
//! All numeric configuration values live here, grouped by the component that
//! consumes them. Constants that constrain each other are co-located and the
//! relationships are checked at compile time.
//!
//! ## Dependency Graph
//!
//! ```text
//! MIN_PAGE_SIZE (512) ... MAX_PAGE_SIZE (65536)
//!       │
//!       ├─> DEFAULT_PAGE_SIZE (4096, must lie within bounds)
//!       │
//!       ├─> DB_HEADER_SIZE (100 bytes, page 1 only)
//!       │
//!       ├─> BTREE_LEAF_HEADER_SIZE (8) / BTREE_INTERIOR_HEADER_SIZE (12)
//!       │
//!       ├─> OVERFLOW_HEADER_SIZE (4): overflow payload = page_size - 4
//!       │
//!       ├─> FREELIST_TRUNK_HEADER_SIZE (8): leaves per trunk = (page_size - 8) / 4
//!       │
//!       ├─> WAL_FRAME_HEADER_SIZE (24): frame = 24 + page_size
//!       │
//!       └─> JOURNAL_RECORD_HEADER_SIZE (12): record = 12 + page_size
//!
//! OVERFULL_PERCENT (90) > UNDERFULL_PERCENT (33)
//!       A page that was just split must not immediately qualify for merging.
//! ```

use std::time::Duration;

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Smallest legal page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest legal page size. Stored in the header as 1.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Page size used when creating a new database without an explicit size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Size of the database header at the start of page 1.
pub const DB_HEADER_SIZE: usize = 100;

/// Magic string at offset 0 of the database header.
pub const DB_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Header size of a B-tree leaf page.
pub const BTREE_LEAF_HEADER_SIZE: usize = 8;

/// Header size of a B-tree interior page (leaf header + rightmost child).
pub const BTREE_INTERIOR_HEADER_SIZE: usize = 12;

/// Size of one entry in the cell pointer array.
pub const CELL_POINTER_SIZE: usize = 2;

/// Bytes of slack required beyond the page header when merging siblings.
pub const MERGE_RESERVED_BYTES: usize = 8;

/// Maximum B-tree depth. Path stacks are sized to this.
pub const MAX_TREE_DEPTH: usize = 20;

const _: () = assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE && DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
const _: () = assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
const _: () = assert!(BTREE_INTERIOR_HEADER_SIZE == BTREE_LEAF_HEADER_SIZE + 4);
const _: () = assert!(DB_HEADER_SIZE < MIN_PAGE_SIZE);

// ============================================================================
// OVERFLOW AND FREELIST CONSTANTS
// ============================================================================

/// Next-pointer header at the start of every overflow page.
pub const OVERFLOW_HEADER_SIZE: usize = 4;

/// Trunk header: next_trunk (4 bytes) + leaf_count (4 bytes).
pub const FREELIST_TRUNK_HEADER_SIZE: usize = 8;

/// Size of one leaf entry in a trunk page.
pub const FREELIST_LEAF_ENTRY_SIZE: usize = 4;

/// Hard cap on the number of pages walked in any overflow or freelist chain.
/// Chains are also bounded by the live page count, whichever is smaller.
pub const MAX_CHAIN_PAGES: usize = 1 << 24;

// ============================================================================
// BALANCER THRESHOLDS
// ============================================================================

/// A page whose used bytes exceed this percentage of the page is split.
pub const OVERFULL_PERCENT: usize = 90;

/// A page whose used bytes fall below this percentage is merged or rebalanced.
pub const UNDERFULL_PERCENT: usize = 33;

const _: () = assert!(
    UNDERFULL_PERCENT * 2 < OVERFULL_PERCENT,
    "both halves of a split page must stay above the underfull threshold"
);

// ============================================================================
// CACHE AND BUFFER POOL CONFIGURATION
// ============================================================================

/// Default number of pages held by the page cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 2000;

/// Number of buffers pre-allocated by a B-tree's cell buffer pool.
pub const DEFAULT_CELL_POOL_SIZE: usize = 8;

// ============================================================================
// WAL CONFIGURATION
// ============================================================================

/// Magic number of the WAL header (big-endian checksums).
pub const WAL_MAGIC: u32 = 0x377f_0682;

/// WAL format version written into the header.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// WAL file header size.
pub const WAL_HEADER_SIZE: usize = 32;

/// Per-frame header size.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Modulus of the two-accumulator frame checksum.
pub const WAL_CHECKSUM_MODULUS: u32 = 65521;

/// Committed frames after which a transaction commit checkpoints the log.
pub const WAL_AUTOCHECKPOINT_FRAMES: u32 = 1000;

// ============================================================================
// ROLLBACK JOURNAL CONFIGURATION
// ============================================================================

/// Magic number opening a rollback journal header.
pub const JOURNAL_MAGIC: u32 = 0xd9d5_05f9;

/// Rollback journal header: magic, page size, page count, nonce.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Per-record header: page number and two checksum words.
pub const JOURNAL_RECORD_HEADER_SIZE: usize = 12;

/// Appended to the database path to name its rollback journal.
pub const JOURNAL_SUFFIX: &str = "-journal";

// ============================================================================
// LOCKING CONFIGURATION
// ============================================================================

/// Default bound on how long a lock request waits before failing with Locked.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a blocked lock request wakes to re-run deadlock detection.
pub const DEADLOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
