//! # Rollback Journal
//!
//! The on-disk half of the page journal. The first time a transaction
//! overwrites a page, the page's prior contents are appended here and the
//! journal is synced before the database file is touched. If the process
//! dies mid-transaction, the next open finds a non-empty ("hot") journal and
//! copies the before-images back, undoing the partial write-through.
//!
//! ## File Layout
//!
//! ```text
//! +-----------------------------+
//! | header (16)                 |
//! +--------------+--------------+
//! | record (12)  | page bytes   |   record 0
//! +--------------+--------------+
//! | record (12)  | page bytes   |   record 1
//! +--------------+--------------+
//! | ...                         |
//! ```
//!
//! ## Header (big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic (0xd9d505f9)
//! 4       4     page size
//! 8       4     database size in pages when the journal began
//! 12      4     nonce, fresh for every transaction
//! ```
//!
//! ## Record Header (big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     page number
//! 4       4     checksum1 over nonce, page number and page bytes
//! 8       4     checksum2
//! ```
//!
//! Pages created by the transaction have no record; replay truncates the
//! database back to the recorded page count instead.
//!
//! ## Lifecycle
//!
//! `begin` truncates the file and writes a fresh header. `clear` truncates it
//! to zero once the transaction has committed or rolled back, so an empty
//! journal means no transaction was in flight. The file itself stays next to
//! the database between transactions.
//!
//! Replay stops at the first record that fails verification. A record is
//! synced before its page is overwritten, so a torn record never guards a
//! page that actually changed.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace, warn};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::file::{DatabaseFile, OsFile};
use super::headers::validate_page_size;
use super::wal::checksum;
use crate::config::{JOURNAL_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_RECORD_HEADER_SIZE, JOURNAL_SUFFIX};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct JournalHeader {
    magic: U32,
    page_size: U32,
    page_count: U32,
    nonce: U32,
}

const _: () = assert!(std::mem::size_of::<JournalHeader>() == JOURNAL_HEADER_SIZE);

impl JournalHeader {
    be_getters! {
        magic: u32,
        page_size: u32,
        page_count: u32,
        nonce: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RecordHeader {
    page_no: U32,
    checksum1: U32,
    checksum2: U32,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == JOURNAL_RECORD_HEADER_SIZE);

impl RecordHeader {
    fn new(nonce: u32, page_no: u32, data: &[u8]) -> Self {
        let (c1, c2) = record_checksum(nonce, page_no, data);
        Self {
            page_no: U32::new(page_no),
            checksum1: U32::new(c1),
            checksum2: U32::new(c2),
        }
    }

    fn verify(&self, nonce: u32, data: &[u8]) -> bool {
        self.page_no() != 0
            && record_checksum(nonce, self.page_no(), data) == (self.checksum1(), self.checksum2())
    }

    be_getters! {
        page_no: u32,
        checksum1: u32,
        checksum2: u32,
    }
}

fn record_checksum(nonce: u32, page_no: u32, data: &[u8]) -> (u32, u32) {
    checksum(&[&nonce.to_be_bytes(), &page_no.to_be_bytes(), data])
}

/// Before-images recovered from a hot journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotJournal {
    pub page_size: usize,
    /// Database size in pages before the interrupted transaction.
    pub page_count: u32,
    pub images: Vec<(u32, Vec<u8>)>,
}

pub struct RollbackJournal {
    file: Box<dyn DatabaseFile>,
    path: Option<PathBuf>,
    page_size: usize,
    nonce: u32,
    end: u64,
}

impl RollbackJournal {
    /// `<database path>-journal`.
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(JOURNAL_SUFFIX);
        PathBuf::from(name)
    }

    /// Opens the journal at `path`, creating an empty one when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path, true)
            .wrap_err_with(|| format!("failed to open rollback journal at {:?}", path))?;

        let mut journal = Self::with_file(Box::new(file));
        journal.path = Some(path.to_path_buf());
        Ok(journal)
    }

    pub fn with_file(file: Box<dyn DatabaseFile>) -> Self {
        Self {
            file,
            path: None,
            page_size: 0,
            nonce: 0,
            end: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a transaction's header has been written and not yet cleared.
    pub fn is_active(&self) -> bool {
        self.end > 0
    }

    /// Starts a new journal for a database of `page_count` pages. Durable
    /// before returning.
    pub fn begin(&mut self, page_size: usize, page_count: u32) -> Result<()> {
        let nonce = rand::random();
        let header = JournalHeader {
            magic: U32::new(JOURNAL_MAGIC),
            page_size: U32::new(page_size as u32),
            page_count: U32::new(page_count),
            nonce: U32::new(nonce),
        };

        self.file.truncate(0)?;
        self.file
            .write_at(0, header.as_bytes())
            .wrap_err("failed to write rollback journal header")?;
        self.file.sync().wrap_err("failed to sync rollback journal")?;

        self.page_size = page_size;
        self.nonce = nonce;
        self.end = JOURNAL_HEADER_SIZE as u64;
        trace!(page_count, "rollback journal started");
        Ok(())
    }

    /// Appends the before-image of `page_no` and syncs it.
    pub fn append(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(self.is_active(), "rollback journal has not been started");
        ensure!(
            data.len() == self.page_size,
            "journal image for page {} is {} bytes, expected {}",
            page_no,
            data.len(),
            self.page_size
        );

        let header = RecordHeader::new(self.nonce, page_no, data);
        let mut record = Vec::with_capacity(JOURNAL_RECORD_HEADER_SIZE + data.len());
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(data);

        self.file
            .write_at(self.end, &record)
            .wrap_err_with(|| format!("failed to journal page {}", page_no))?;
        self.file.sync().wrap_err("failed to sync rollback journal")?;

        self.end += record.len() as u64;
        trace!(page_no, "journaled before-image");
        Ok(())
    }

    /// Empties the journal. Once this returns the transaction can no longer
    /// be undone by a reopen.
    pub fn clear(&mut self) -> Result<()> {
        if self.file.len()? > 0 {
            self.file.truncate(0)?;
            self.file.sync().wrap_err("failed to sync rollback journal")?;
        }
        self.end = 0;
        Ok(())
    }

    /// Reads a hot journal. `None` when the file is empty or its header does
    /// not verify; in both cases the database was never touched.
    pub fn read_hot(&self) -> Result<Option<HotJournal>> {
        let len = self.file.len()?;
        if len < JOURNAL_HEADER_SIZE as u64 {
            return Ok(None);
        }

        let mut bytes = [0u8; JOURNAL_HEADER_SIZE];
        self.file.read_at(0, &mut bytes)?;
        let header = JournalHeader::read_from_bytes(&bytes)
            .map_err(|e| eyre::eyre!("failed to parse JournalHeader: {:?}", e))?;
        if header.magic() != JOURNAL_MAGIC
            || validate_page_size(header.page_size() as usize).is_err()
            || header.page_count() == 0
        {
            warn!(path = ?self.path, "ignoring rollback journal with an invalid header");
            return Ok(None);
        }

        let page_size = header.page_size() as usize;
        let record_size = (JOURNAL_RECORD_HEADER_SIZE + page_size) as u64;
        let mut images = Vec::new();
        let mut offset = JOURNAL_HEADER_SIZE as u64;
        let mut buf = vec![0u8; record_size as usize];

        while offset + record_size <= len {
            self.file.read_at(offset, &mut buf)?;
            let (head, data) = buf.split_at(JOURNAL_RECORD_HEADER_SIZE);
            let record = RecordHeader::read_from_bytes(head)
                .map_err(|e| eyre::eyre!("failed to parse journal record: {:?}", e))?;
            if !record.verify(header.nonce(), data) {
                debug!(offset, "rollback journal ends at unverified record");
                break;
            }
            images.push((record.page_no(), data.to_vec()));
            offset += record_size;
        }

        Ok(Some(HotJournal {
            page_size,
            page_count: header.page_count(),
            images,
        }))
    }

    /// Undoes an interrupted transaction in `db`: writes every before-image
    /// back, cuts off pages the transaction added, syncs, and clears the
    /// journal. Returns the number of pages restored, or `None` when the
    /// journal was not hot.
    pub fn rollback_into(&mut self, db: &dyn DatabaseFile) -> Result<Option<usize>> {
        let Some(hot) = self.read_hot()? else {
            self.clear()?;
            return Ok(None);
        };

        for (page_no, data) in hot.images.iter().rev() {
            let offset = (*page_no as u64 - 1) * hot.page_size as u64;
            db.write_at(offset, data)
                .wrap_err_with(|| format!("failed to replay journaled page {}", page_no))?;
        }

        let len = hot.page_count as u64 * hot.page_size as u64;
        if db.len()? > len {
            db.truncate(len)?;
        }
        db.sync().wrap_err("failed to sync database after journal replay")?;
        self.clear()?;

        warn!(
            path = ?self.path,
            pages = hot.images.len(),
            page_count = hot.page_count,
            "rolled back interrupted transaction from hot journal"
        );
        Ok(Some(hot.images.len()))
    }
}

impl std::fmt::Debug for RollbackJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackJournal")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::MemoryFile;
    use std::sync::Arc;

    const PS: usize = 512;

    struct SharedFile(Arc<MemoryFile>);

    impl DatabaseFile for SharedFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.0.read_at(offset, buf)
        }
        fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
            self.0.write_at(offset, data)
        }
        fn truncate(&self, len: u64) -> Result<()> {
            self.0.truncate(len)
        }
        fn sync(&self) -> Result<()> {
            self.0.sync()
        }
        fn len(&self) -> Result<u64> {
            self.0.len()
        }
    }

    fn shared_journal() -> (Arc<MemoryFile>, RollbackJournal) {
        let file = Arc::new(MemoryFile::new());
        let journal = RollbackJournal::with_file(Box::new(SharedFile(Arc::clone(&file))));
        (file, journal)
    }

    fn database(pages: &[u8]) -> MemoryFile {
        let db = MemoryFile::new();
        for (i, &fill) in pages.iter().enumerate() {
            db.write_at((i * PS) as u64, &[fill; PS]).unwrap();
        }
        db
    }

    #[test]
    fn journal_path_appends_suffix() {
        let path = RollbackJournal::path_for(Path::new("/tmp/main.db"));
        assert_eq!(path, PathBuf::from("/tmp/main.db-journal"));
    }

    #[test]
    fn append_requires_begin() {
        let (_file, mut journal) = shared_journal();
        assert!(journal.append(2, &[0u8; PS]).is_err());
    }

    #[test]
    fn records_land_after_header() {
        let (file, mut journal) = shared_journal();
        journal.begin(PS, 3).unwrap();
        journal.append(2, &[1u8; PS]).unwrap();
        journal.append(3, &[2u8; PS]).unwrap();

        assert_eq!(file.len().unwrap(), (16 + 2 * (12 + PS)) as u64);
        let hot = journal.read_hot().unwrap().unwrap();
        assert_eq!(hot.page_count, 3);
        assert_eq!(hot.images, vec![(2, vec![1u8; PS]), (3, vec![2u8; PS])]);
    }

    #[test]
    fn replay_restores_images_and_truncates_growth() {
        let db = database(&[0, 7, 7, 9]);
        let (file, mut journal) = shared_journal();
        journal.begin(PS, 3).unwrap();
        journal.append(2, &[1u8; PS]).unwrap();

        let mut reopened = RollbackJournal::with_file(Box::new(SharedFile(Arc::clone(&file))));
        assert_eq!(reopened.rollback_into(&db).unwrap(), Some(1));

        assert_eq!(db.len().unwrap(), (3 * PS) as u64);
        let mut page = vec![0u8; PS];
        db.read_at(PS as u64, &mut page).unwrap();
        assert_eq!(page, vec![1u8; PS]);
        db.read_at(2 * PS as u64, &mut page).unwrap();
        assert_eq!(page, vec![7u8; PS]);
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn torn_record_is_not_replayed() {
        let db = database(&[0, 7, 7]);
        let (file, mut journal) = shared_journal();
        journal.begin(PS, 3).unwrap();
        journal.append(2, &[1u8; PS]).unwrap();
        journal.append(3, &[2u8; PS]).unwrap();
        let second_record = (16 + 12 + PS + 12 + 5) as u64;
        file.write_at(second_record, &[0xee]).unwrap();

        let hot = journal.read_hot().unwrap().unwrap();
        assert_eq!(hot.images.len(), 1);

        journal.rollback_into(&db).unwrap();
        let mut page = vec![0u8; PS];
        db.read_at(2 * PS as u64, &mut page).unwrap();
        assert_eq!(page, vec![7u8; PS]);
    }

    #[test]
    fn records_from_an_earlier_transaction_do_not_verify() {
        let (file, mut journal) = shared_journal();
        journal.begin(PS, 3).unwrap();
        journal.append(2, &[1u8; PS]).unwrap();
        let mut stale = vec![0u8; 12 + PS];
        file.read_at(16, &mut stale).unwrap();

        journal.clear().unwrap();
        journal.begin(PS, 3).unwrap();
        file.write_at(16, &stale).unwrap();

        assert!(journal.read_hot().unwrap().unwrap().images.is_empty());
    }

    #[test]
    fn cleared_or_garbage_journal_is_cold() {
        let db = database(&[0, 7]);
        let (file, mut journal) = shared_journal();
        journal.begin(PS, 2).unwrap();
        journal.append(2, &[1u8; PS]).unwrap();
        journal.clear().unwrap();
        assert!(!journal.is_active());
        assert_eq!(journal.read_hot().unwrap(), None);

        file.write_at(0, &[0xab; 40]).unwrap();
        assert_eq!(journal.rollback_into(&db).unwrap(), None);
        assert_eq!(file.len().unwrap(), 0);
        assert_eq!(db.len().unwrap(), (2 * PS) as u64);
    }
}
