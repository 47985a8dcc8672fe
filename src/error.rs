//! # Storage Errors
//!
//! All fallible operations return `eyre::Result`. Conditions that callers need
//! to branch on are raised as a [`StorageError`] inside the report, so a caller
//! can tell "retry the transaction" apart from "the file is damaged":
//!
//! ```ignore
//! match storage_error(&report) {
//!     Some(e) if e.is_retryable() => retry(),
//!     Some(e) if e.is_corruption() => abort_and_report(),
//!     _ => return Err(report),
//! }
//! ```
//!
//! Context added with `wrap_err` does not hide the typed error; `downcast_ref`
//! looks through the context chain.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    InvalidPageSize(u32),
    InvalidHeader(&'static str),
    InvalidCell(&'static str),
    InvalidPage { page_no: u32, page_count: u32 },
    Corrupt(String),
    PageFull { page_no: u32, needed: usize, available: usize },
    CellCount { requested: usize, available: usize },
    Locked { resource: String },
    Deadlock { resource: String, victim: u64 },
    NoTransaction,
}

impl StorageError {
    /// Lock timeouts and deadlocks: the transaction may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Locked { .. } | StorageError::Deadlock { .. })
    }

    /// Structural damage or malformed on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupt(_)
                | StorageError::InvalidPage { .. }
                | StorageError::InvalidCell(_)
                | StorageError::InvalidHeader(_)
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPageSize(size) => write!(
                f,
                "invalid page size {}: must be a power of two between 512 and 65536",
                size
            ),
            StorageError::InvalidHeader(reason) => {
                write!(f, "invalid database header: {}", reason)
            }
            StorageError::InvalidCell(reason) => write!(f, "invalid cell format: {}", reason),
            StorageError::InvalidPage {
                page_no,
                page_count,
            } => write!(
                f,
                "invalid page number {} (database has {} pages)",
                page_no, page_count
            ),
            StorageError::Corrupt(detail) => write!(f, "database corruption: {}", detail),
            StorageError::PageFull {
                page_no,
                needed,
                available,
            } => write!(
                f,
                "page {} is full: {} bytes needed but only {} available",
                page_no, needed, available
            ),
            StorageError::CellCount {
                requested,
                available,
            } => write!(
                f,
                "cannot move {} cells: source page holds only {}",
                requested, available
            ),
            StorageError::Locked { resource } => {
                write!(f, "database is locked: timed out waiting for {}", resource)
            }
            StorageError::Deadlock { resource, victim } => write!(
                f,
                "deadlock detected on {}: holder {} chosen as victim",
                resource, victim
            ),
            StorageError::NoTransaction => write!(f, "no active transaction"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Extracts the typed storage error carried by a report, if any.
pub fn storage_error(report: &eyre::Report) -> Option<&StorageError> {
    report.downcast_ref::<StorageError>()
}
