//! # Pager Builder
//!
//! Fluent configuration for opening a [`PageManager`].
//!
//! | Option         | Default                  | Description                        |
//! |----------------|--------------------------|------------------------------------|
//! | page_size      | `DEFAULT_PAGE_SIZE`      | Page size for newly created files  |
//! | cache_capacity | `DEFAULT_CACHE_CAPACITY` | Pages held by the LRU cache        |
//! | create         | true                     | Create the file when missing       |
//!
//! The page size only applies to new files. An existing file is always read
//! with the page size stored in its header.
//!
//! `open` also opens `<path>-journal` and replays it when a previous process
//! died mid-transaction. In-memory and caller-supplied files run without an
//! on-disk journal.
//!
//! ```ignore
//! let pager = PageManager::builder()
//!     .page_size(1024)
//!     .cache_capacity(256)
//!     .open("data.db")?;
//! ```

use std::path::Path;

use eyre::Result;

use super::file::{DatabaseFile, MemoryFile, OsFile};
use super::headers::validate_page_size;
use super::journal::RollbackJournal;
use super::pager::PageManager;
use crate::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct PagerBuilder {
    page_size: usize,
    cache_capacity: usize,
    create: bool,
}

impl Default for PagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PagerBuilder {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            create: true,
        }
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    /// Whether a missing file is created. When false, opening a missing file
    /// fails.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<PageManager> {
        validate_page_size(self.page_size)?;
        let path = path.as_ref();
        let file = OsFile::open(path, self.create)?;
        let journal = RollbackJournal::open(RollbackJournal::path_for(path))?;

        PageManager::from_parts(
            Box::new(file),
            Some(path.to_path_buf()),
            Some(journal),
            self.page_size,
            self.cache_capacity,
        )
    }

    pub fn open_in_memory(self) -> Result<PageManager> {
        self.open_file(Box::new(MemoryFile::new()))
    }

    pub fn open_file(self, file: Box<dyn DatabaseFile>) -> Result<PageManager> {
        validate_page_size(self.page_size)?;
        PageManager::from_parts(file, None, None, self.page_size, self.cache_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use tempfile::tempdir;

    #[test]
    fn builder_defaults() {
        let pager = PagerBuilder::new().open_in_memory().unwrap();

        assert_eq!(pager.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(pager.usable_size(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn builder_rejects_bad_page_size() {
        let err = PagerBuilder::new().page_size(3000).open_in_memory().unwrap_err();

        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::InvalidPageSize(3000))
        );
    }

    #[test]
    fn builder_without_create_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let result = PagerBuilder::new()
            .create(false)
            .open(dir.path().join("missing.db"));

        assert!(result.is_err());
    }

    #[test]
    fn existing_file_keeps_stored_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sized.db");
        PagerBuilder::new().page_size(2048).open(&path).unwrap();

        let pager = PagerBuilder::new().page_size(512).open(&path).unwrap();
        assert_eq!(pager.page_size(), 2048);
    }
}
