//! # Database Header
//!
//! The first 100 bytes of page 1 hold the database header. The layout is the
//! classic B-tree file header; every multi-byte integer is big-endian.
//!
//! ## Header Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------------
//! 0       16    magic "SQLite format 3\0"
//! 16      2     page_size (1 means 65536)
//! 18      1     write_version
//! 19      1     read_version
//! 20      1     reserved_space (bytes reserved at the end of each page)
//! 21      1     max_payload_fraction (64)
//! 22      1     min_payload_fraction (32)
//! 23      1     leaf_payload_fraction (32)
//! 24      4     change_counter
//! 28      4     database_size (pages)
//! 32      4     first_freelist_trunk
//! 36      4     freelist_count
//! 40      4     schema_cookie
//! 44      4     schema_format
//! 48      4     default_cache_size
//! 52      4     largest_root_page
//! 56      4     text_encoding
//! 60      4     user_version
//! 64      4     incremental_vacuum
//! 68      4     application_id
//! 72      20    reserved (zero)
//! 92      4     version_valid_for
//! 96      4     library_version
//! ```
//!
//! ## Zerocopy Safety
//!
//! `DatabaseHeader` derives `FromBytes`, `IntoBytes`, `Immutable`,
//! `KnownLayout` and `Unaligned`, so it can be read from and written to any
//! byte offset without alignment concerns.
//!
//! ## Durability Anchor
//!
//! `database_size` must always equal the page manager's live page count. The
//! page manager rewrites the header on every allocation and bumps
//! `change_counter` / `version_valid_for` together on every write.

use eyre::{bail, ensure, Result};
use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DB_HEADER_MAGIC, DB_HEADER_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::StorageError;

/// Library version number written at offset 96.
pub const LIBRARY_VERSION_NUMBER: u32 = 3_045_000;

const SCHEMA_FORMAT: u32 = 4;
const TEXT_ENCODING_UTF8: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DatabaseHeader {
    magic: [u8; 16],
    page_size: U16,
    write_version: u8,
    read_version: u8,
    reserved_space: u8,
    max_payload_fraction: u8,
    min_payload_fraction: u8,
    leaf_payload_fraction: u8,
    change_counter: U32,
    database_size: U32,
    first_freelist_trunk: U32,
    freelist_count: U32,
    schema_cookie: U32,
    schema_format: U32,
    default_cache_size: U32,
    largest_root_page: U32,
    text_encoding: U32,
    user_version: U32,
    incremental_vacuum: U32,
    application_id: U32,
    reserved: [u8; 20],
    version_valid_for: U32,
    library_version: U32,
}

const _: () = assert!(std::mem::size_of::<DatabaseHeader>() == DB_HEADER_SIZE);

/// Fails with `InvalidPageSize` unless `size` is a power of two in [512, 65536].
pub fn validate_page_size(size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) || !size.is_power_of_two() {
        bail!(StorageError::InvalidPageSize(size as u32));
    }
    Ok(())
}

impl DatabaseHeader {
    pub fn new(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;

        let mut header = Self {
            magic: *DB_HEADER_MAGIC,
            page_size: U16::new(0),
            write_version: 1,
            read_version: 1,
            reserved_space: 0,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            change_counter: U32::new(0),
            database_size: U32::new(1),
            first_freelist_trunk: U32::new(0),
            freelist_count: U32::new(0),
            schema_cookie: U32::new(0),
            schema_format: U32::new(SCHEMA_FORMAT),
            default_cache_size: U32::new(0),
            largest_root_page: U32::new(0),
            text_encoding: U32::new(TEXT_ENCODING_UTF8),
            user_version: U32::new(0),
            incremental_vacuum: U32::new(0),
            application_id: U32::new(0),
            reserved: [0u8; 20],
            version_valid_for: U32::new(0),
            library_version: U32::new(LIBRARY_VERSION_NUMBER),
        };
        header.set_page_size(page_size);
        Ok(header)
    }

    /// Parses and validates a header. Bad magic and short buffers are
    /// `InvalidHeader`; an illegal page size is `InvalidPageSize`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            StorageError::InvalidHeader("truncated header")
        );

        let header = Self::read_from_bytes(&bytes[..DB_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse DatabaseHeader: {:?}", e))?;

        ensure!(
            &header.magic == DB_HEADER_MAGIC,
            StorageError::InvalidHeader("bad magic string")
        );
        validate_page_size(header.page_size())?;

        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            "buffer too small for DatabaseHeader: {} < {}",
            bytes.len(),
            DB_HEADER_SIZE
        );

        bytes[..DB_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        match self.page_size.get() {
            1 => MAX_PAGE_SIZE,
            n => n as usize,
        }
    }

    pub fn set_page_size(&mut self, size: usize) {
        let stored = if size == MAX_PAGE_SIZE { 1 } else { size as u16 };
        self.page_size = U16::new(stored);
    }

    /// Page size minus the per-page reserved region.
    pub fn usable_size(&self) -> usize {
        self.page_size() - self.reserved_space as usize
    }

    /// Marks a header write: bumps the change counter and keeps
    /// `version_valid_for` in step so the stored page count is trusted.
    pub fn bump_change_counter(&mut self) {
        let next = self.change_counter.get().wrapping_add(1);
        self.change_counter = U32::new(next);
        self.version_valid_for = U32::new(next);
    }

    /// True when `database_size` may be trusted over the file length.
    pub fn size_is_valid(&self) -> bool {
        self.database_size.get() != 0
            && self.change_counter.get() == self.version_valid_for.get()
    }

    be_accessors! {
        write_version: u8,
        read_version: u8,
        reserved_space: u8,
        database_size: u32,
        first_freelist_trunk: u32,
        freelist_count: u32,
        schema_cookie: u32,
        schema_format: u32,
        default_cache_size: u32,
        largest_root_page: u32,
        text_encoding: u32,
        user_version: u32,
        incremental_vacuum: u32,
        application_id: u32,
    }

    be_getters! {
        change_counter: u32,
        version_valid_for: u32,
        library_version: u32,
    }
}
