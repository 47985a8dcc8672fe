//! # Page Manager
//!
//! The page manager owns the database file, the in-memory copy of the
//! database header, the page cache and page allocation. Every page read and
//! write in the engine funnels through it.
//!
//! ## File Layout
//!
//! ```text
//! page N occupies bytes [(N-1) * page_size, N * page_size)
//!
//! +-------------------------------+  offset 0
//! | page 1: 100-byte header + ... |
//! +-------------------------------+  page_size
//! | page 2                        |
//! +-------------------------------+  2 * page_size
//! | ...                           |
//! ```
//!
//! ## Write-Through
//!
//! `write_page` writes the full page buffer at its offset immediately and
//! refreshes the cached copy. The page manager never defers writes; the
//! rollback journal makes the early writes undoable.
//!
//! ## Allocation Order
//!
//! 1. The in-process free list (pages released by `free_page`)
//! 2. The on-disk freelist trunk chain
//! 3. Growing the file by one page
//!
//! Growth truncates the file to the new length and rewrites the header
//! synchronously, so the header's page count is always the live page count.
//! `flush_free_list` (run by `sync`) moves the in-process list into the
//! trunk chain.
//!
//! ## Page Journal
//!
//! While a journal is active, the first write to each page captures its
//! before-image (or `None` for pages created after the journal began).
//! Header rewrites journal page 1. Transactions use the journal as their
//! undo log and restore it in reverse order on rollback.
//!
//! File-backed pagers also append each before-image to `<path>-journal` and
//! sync it before the page is overwritten. `end_journal` empties that file
//! and is the point after which a transaction survives a crash. Opening a
//! database with a non-empty journal replays it first.
//!
//! ## Concurrency
//!
//! The page manager is `Send + Sync`; internal state sits behind
//! `parking_lot` locks. It does not serialize B-tree mutations: callers hold
//! a transaction lock before mutating pages.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace, Level};

use super::builder::PagerBuilder;
use super::cache::{CacheStats, PageCache};
use super::file::DatabaseFile;
use super::freelist::FreelistManager;
use super::headers::DatabaseHeader;
use super::journal::RollbackJournal;
use super::page::Page;
use crate::config::DB_HEADER_SIZE;
use crate::error::StorageError;

/// A page's contents before the first write made while journaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub page_no: u32,
    /// `None` for pages that did not exist when the journal began.
    pub before: Option<Vec<u8>>,
}

struct PageJournal {
    entries: Vec<JournalEntry>,
    seen: HashSet<u32>,
    page_count: u32,
}

pub struct PageManager {
    file: Box<dyn DatabaseFile>,
    path: Option<PathBuf>,
    page_size: usize,
    usable_size: usize,
    header: RwLock<DatabaseHeader>,
    cache: PageCache,
    free_pages: Mutex<Vec<u32>>,
    journal: Mutex<Option<PageJournal>>,
    rollback: Option<Mutex<RollbackJournal>>,
    alloc_lock: Mutex<()>,
}

impl PageManager {
    pub fn builder() -> PagerBuilder {
        PagerBuilder::new()
    }

    /// Opens or creates a database file with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        PagerBuilder::new().open(path)
    }

    /// Wraps an already-open file. An empty file is initialised with a fresh
    /// header using `page_size`; otherwise the page size comes from the
    /// stored header.
    pub fn with_file(
        file: Box<dyn DatabaseFile>,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        Self::from_parts(file, None, None, page_size, cache_capacity)
    }

    pub(crate) fn from_parts(
        file: Box<dyn DatabaseFile>,
        path: Option<PathBuf>,
        mut rollback: Option<RollbackJournal>,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        if let Some(journal) = rollback.as_mut() {
            journal
                .rollback_into(file.as_ref())
                .wrap_err_with(|| format!("failed to replay hot journal for {:?}", path))?;
        }

        let header = if file.is_empty()? {
            let header = DatabaseHeader::new(page_size)?;
            let mut page_one = vec![0u8; page_size];
            header.write_to(&mut page_one)?;
            file.write_at(0, &page_one)?;
            file.sync()?;
            debug!(page_size, "initialised new database file");
            header
        } else {
            Self::load_header(file.as_ref())?
        };

        let page_size = header.page_size();
        let usable_size = header.usable_size();

        Ok(Self {
            file,
            path,
            page_size,
            usable_size,
            header: RwLock::new(header),
            cache: PageCache::new(cache_capacity),
            free_pages: Mutex::new(Vec::new()),
            journal: Mutex::new(None),
            rollback: rollback.map(Mutex::new),
            alloc_lock: Mutex::new(()),
        })
    }

    fn load_header(file: &dyn DatabaseFile) -> Result<DatabaseHeader> {
        let len = file.len()?;
        if len < DB_HEADER_SIZE as u64 {
            bail!(StorageError::InvalidHeader("truncated header"));
        }

        let mut bytes = [0u8; DB_HEADER_SIZE];
        file.read_at(0, &mut bytes)?;
        let mut header = DatabaseHeader::from_bytes(&bytes)?;

        let pages_on_disk = (len / header.page_size() as u64).max(1) as u32;
        if !header.size_is_valid() {
            header.set_database_size(pages_on_disk);
        }
        Ok(header)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> DatabaseHeader {
        *self.header.read()
    }

    /// Applies `f` to the header, bumps the change counter and writes the
    /// header to page 1 synchronously.
    pub fn update_header<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut DatabaseHeader),
    {
        let mut header = self.header.write();
        f(&mut header);
        header.bump_change_counter();

        self.journal_before_image(1)?;
        let mut bytes = [0u8; DB_HEADER_SIZE];
        header.write_to(&mut bytes)?;
        self.file
            .write_at(0, &bytes)
            .wrap_err("failed to write database header")?;
        self.cache.invalidate(1);
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    pub fn num_pages(&self) -> u32 {
        self.header.read().database_size()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn page_offset(&self, page_no: u32) -> u64 {
        (page_no as u64 - 1) * self.page_size as u64
    }

    fn check_page_no(&self, page_no: u32) -> Result<()> {
        let page_count = self.num_pages();
        if page_no == 0 || page_no > page_count {
            bail!(StorageError::InvalidPage {
                page_no,
                page_count
            });
        }
        Ok(())
    }

    pub fn read_page(&self, page_no: u32) -> Result<Page> {
        self.check_page_no(page_no)?;

        if let Some(page) = self.cache.get(page_no) {
            trace!(page_no, "cache hit");
            return Ok(page);
        }
        trace!(page_no, "cache miss");

        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        self.file
            .read_at(self.page_offset(page_no), &mut data)
            .wrap_err_with(|| format!("failed to read page {}", page_no))?;

        if page_no == 1 {
            DatabaseHeader::from_bytes(&data)?;
        }

        let page = Page::from_bytes(page_no, data);
        self.cache.put(page.clone());
        Ok(page)
    }

    /// Writes the whole page at its offset and clears its dirty flag.
    pub fn write_page(&self, page: &mut Page) -> Result<()> {
        let page_no = page.number();
        self.check_page_no(page_no)?;
        ensure!(
            page.size() == self.page_size,
            "page {} buffer is {} bytes, expected {}",
            page_no,
            page.size(),
            self.page_size
        );

        self.journal_before_image(page_no)?;
        self.file
            .write_at(self.page_offset(page_no), page.data())
            .wrap_err_with(|| format!("failed to write page {}", page_no))?;

        page.clear_dirty();
        if page_no == 1 {
            *self.header.write() = DatabaseHeader::from_bytes(page.data())?;
        }
        self.cache.put(page.clone());
        Ok(())
    }

    /// Writes raw page bytes outside the journal, growing the file when the
    /// page lies past its end. Used to replay undo images and WAL frames.
    pub fn restore_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(page_no != 0, "cannot restore page 0");
        ensure!(
            data.len() == self.page_size,
            "restore image for page {} is {} bytes, expected {}",
            page_no,
            data.len(),
            self.page_size
        );

        self.file
            .write_at(self.page_offset(page_no), data)
            .wrap_err_with(|| format!("failed to restore page {}", page_no))?;
        self.cache.invalidate(page_no);

        if page_no == 1 {
            *self.header.write() = DatabaseHeader::from_bytes(data)?;
        } else if page_no > self.num_pages() {
            let mut header = self.header.write();
            header.set_database_size(page_no);
        }
        Ok(())
    }

    /// Hands out a page number, preferring recycled pages over file growth.
    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn allocate_page(&self) -> Result<u32> {
        let _guard = self.alloc_lock.lock();

        let recycled = self.free_pages.lock().pop();
        if let Some(page_no) = recycled {
            self.cache.invalidate(page_no);
            debug!(page_no, "allocated page from in-process free list");
            return Ok(page_no);
        }

        if let Some(page_no) = FreelistManager::new(self).allocate_page()? {
            self.cache.invalidate(page_no);
            debug!(page_no, "allocated page from freelist");
            return Ok(page_no);
        }

        let page_no = self.num_pages() + 1;
        let new_len = page_no as u64 * self.page_size as u64;
        self.file
            .truncate(new_len)
            .wrap_err_with(|| format!("failed to grow database to {} pages", page_no))?;
        self.update_header(|h| h.set_database_size(page_no))?;

        debug!(page_no, "allocated page by growing file");
        Ok(page_no)
    }

    /// Returns a page to the in-process free list.
    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn free_page(&self, page_no: u32) -> Result<()> {
        self.check_page_no(page_no)?;
        ensure!(page_no != 1, "page 1 holds the database header and cannot be freed");

        let mut free = self.free_pages.lock();
        ensure!(!free.contains(&page_no), "page {} is already free", page_no);

        self.cache.invalidate(page_no);
        free.push(page_no);
        Ok(())
    }

    /// Moves the in-process free list into the on-disk trunk chain.
    pub fn flush_free_list(&self) -> Result<usize> {
        let _guard = self.alloc_lock.lock();
        let pending = std::mem::take(&mut *self.free_pages.lock());

        let freelist = FreelistManager::new(self);
        for &page_no in &pending {
            freelist.free_page(page_no)?;
        }

        if !pending.is_empty() {
            debug!(count = pending.len(), "flushed free list");
        }
        Ok(pending.len())
    }

    /// Splices empty trunks out of the freelist chain and keeps the spliced
    /// pages on the in-process free list.
    pub fn compact_freelist(&self) -> Result<usize> {
        let _guard = self.alloc_lock.lock();
        let removed = FreelistManager::new(self).compact()?;
        let count = removed.len();
        self.free_pages.lock().extend(removed);
        Ok(count)
    }

    /// Free pages on disk plus pages waiting on the in-process list.
    pub fn free_page_count(&self) -> Result<u32> {
        let on_disk = FreelistManager::new(self).count_free_pages()?;
        Ok(on_disk + self.free_pages.lock().len() as u32)
    }

    pub fn pending_free_pages(&self) -> usize {
        self.free_pages.lock().len()
    }

    pub fn sync(&self) -> Result<()> {
        self.flush_free_list()?;
        self.file.sync()
    }

    pub fn close(self) -> Result<()> {
        self.sync()?;
        debug!(path = ?self.path, "closed database");
        Ok(())
    }

    /// Starts capturing before-images. Pending frees are flushed first so the
    /// journal covers every page the caller can touch.
    pub fn begin_journal(&self) -> Result<()> {
        self.flush_free_list()?;

        let mut journal = self.journal.lock();
        ensure!(journal.is_none(), "page journal is already active");
        if let Some(rollback) = &self.rollback {
            rollback.lock().begin(self.page_size, self.num_pages())?;
        }
        *journal = Some(PageJournal {
            entries: Vec::new(),
            seen: HashSet::new(),
            page_count: self.num_pages(),
        });
        Ok(())
    }

    /// Stops journaling and returns the captured before-images in capture
    /// order. The on-disk journal is left in place until `end_journal`.
    pub fn take_journal(&self) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .take()
            .map(|j| j.entries)
            .unwrap_or_default()
    }

    pub fn journal_active(&self) -> bool {
        self.journal.lock().is_some()
    }

    /// Empties the on-disk journal. Call only once the database file holds
    /// the state that should survive: after `sync` on commit, or after the
    /// before-images were restored and synced on rollback.
    pub fn end_journal(&self) -> Result<()> {
        if let Some(rollback) = &self.rollback {
            rollback.lock().clear()?;
        }
        Ok(())
    }

    /// Path of the on-disk rollback journal, if this pager keeps one.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.rollback
            .as_ref()
            .and_then(|r| r.lock().path().map(Path::to_path_buf))
    }

    fn journal_before_image(&self, page_no: u32) -> Result<()> {
        let mut guard = self.journal.lock();
        let Some(journal) = guard.as_mut() else {
            return Ok(());
        };
        if journal.seen.contains(&page_no) {
            return Ok(());
        }

        let before = if page_no <= journal.page_count {
            let mut data = vec![0u8; self.page_size];
            self.file
                .read_at(self.page_offset(page_no), &mut data)
                .wrap_err_with(|| format!("failed to journal page {}", page_no))?;
            if let Some(rollback) = &self.rollback {
                rollback.lock().append(page_no, &data)?;
            }
            Some(data)
        } else {
            None
        };

        journal.seen.insert(page_no);
        journal.entries.push(JournalEntry { page_no, before });
        Ok(())
    }

    /// Re-reads the header from disk, truncates the file to the stored page
    /// count and drops all cached and pending state.
    pub fn reload_header(&self) -> Result<()> {
        let header = Self::load_header(self.file.as_ref())?;
        let len = header.database_size() as u64 * self.page_size as u64;
        if self.file.len()? > len {
            self.file.truncate(len)?;
        }

        *self.header.write() = header;
        self.cache.clear();
        self.free_pages.lock().clear();
        debug!(pages = header.database_size(), "reloaded database header");
        Ok(())
    }
}

impl std::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageManager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("num_pages", &self.num_pages())
            .field("cache", &self.cache)
            .finish()
    }
}
