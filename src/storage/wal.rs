//! # Write-Ahead Log
//!
//! A single-file, frame-based redo log. Each committed transaction appends
//! one frame per changed page; the last frame of a transaction carries the
//! database size and marks the commit.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------+
//! | WAL header (32)    |
//! +--------------------+--------------------+
//! | frame header (24)  | page (page_size)   |   frame 0
//! +--------------------+--------------------+
//! | frame header (24)  | page (page_size)   |   frame 1
//! +--------------------+--------------------+
//! | ...                                     |
//! ```
//!
//! Frame `i` starts at `32 + i * (24 + page_size)`.
//!
//! ## WAL Header (big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic (0x377f0682)
//! 4       4     format version (3007000)
//! 8       4     page size
//! 12      4     sequence: frames covered by the last commit
//! 16      4     salt1
//! 20      4     salt2
//! 24      4     checksum1 over bytes 0..24
//! 28      4     checksum2
//! ```
//!
//! ## Frame Header (big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     page number
//! 4       4     commit size: database size in pages on the commit frame, else 0
//! 8       4     salt1 (must match the WAL header)
//! 12      4     salt2 (must match the WAL header)
//! 16      4     checksum1 over bytes 0..16 of the frame header and the page
//! 20      4     checksum2
//! ```
//!
//! ## Checksum
//!
//! Two running accumulators modulo 65521, Adler-style:
//!
//! ```text
//! for each byte b:  s1 = (s1 + b) % 65521
//!                   s2 = (s2 + s1) % 65521
//! ```
//!
//! ## Recovery
//!
//! Frames are verified in order from the header forward. The first frame
//! with a bad checksum or stale salts ends the log; nothing past it is
//! trusted. Verified frames after the last verified commit frame belong to
//! a transaction that never committed: the log is truncated behind that
//! commit frame so new frames never extend the dead transaction.
//!
//! ## Checkpoint
//!
//! Copies the latest committed image of every page into the database,
//! syncs it, then resets the log to a bare header with `salt1 + 1` and a
//! fresh random `salt2`, so frames from the previous generation can never
//! verify again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, instrument, trace, warn, Level};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::file::{DatabaseFile, OsFile};
use super::pager::PageManager;
use crate::config::{
    WAL_CHECKSUM_MODULUS, WAL_FORMAT_VERSION, WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC,
};
use crate::error::StorageError;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalHeader {
    magic: U32,
    format_version: U32,
    page_size: U32,
    sequence: U32,
    salt1: U32,
    salt2: U32,
    checksum1: U32,
    checksum2: U32,
}

const _: () = assert!(std::mem::size_of::<WalHeader>() == WAL_HEADER_SIZE);

impl WalHeader {
    fn new(page_size: usize, salt1: u32, salt2: u32) -> Self {
        let mut header = Self {
            magic: U32::new(WAL_MAGIC),
            format_version: U32::new(WAL_FORMAT_VERSION),
            page_size: U32::new(page_size as u32),
            sequence: U32::new(0),
            salt1: U32::new(salt1),
            salt2: U32::new(salt2),
            checksum1: U32::new(0),
            checksum2: U32::new(0),
        };
        header.seal();
        header
    }

    fn seal(&mut self) {
        let (c1, c2) = checksum(&[&self.as_bytes()[..24]]);
        self.checksum1 = U32::new(c1);
        self.checksum2 = U32::new(c2);
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Self::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("failed to parse WalHeader: {:?}", e))?;

        ensure!(
            header.magic() == WAL_MAGIC,
            StorageError::InvalidHeader("bad WAL magic")
        );
        let (c1, c2) = checksum(&[&bytes[..24]]);
        if (c1, c2) != (header.checksum1(), header.checksum2()) {
            bail!(StorageError::Corrupt("WAL header checksum mismatch".into()));
        }
        Ok(header)
    }

    be_getters! {
        magic: u32,
        format_version: u32,
        page_size: u32,
        checksum1: u32,
        checksum2: u32,
    }

    be_accessors! {
        sequence: u32,
        salt1: u32,
        salt2: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalFrameHeader {
    page_no: U32,
    commit_size: U32,
    salt1: U32,
    salt2: U32,
    checksum1: U32,
    checksum2: U32,
}

const _: () = assert!(std::mem::size_of::<WalFrameHeader>() == WAL_FRAME_HEADER_SIZE);

impl WalFrameHeader {
    fn new(page_no: u32, commit_size: u32, salt1: u32, salt2: u32, data: &[u8]) -> Self {
        let mut header = Self {
            page_no: U32::new(page_no),
            commit_size: U32::new(commit_size),
            salt1: U32::new(salt1),
            salt2: U32::new(salt2),
            checksum1: U32::new(0),
            checksum2: U32::new(0),
        };
        let (c1, c2) = header.compute_checksum(data);
        header.checksum1 = U32::new(c1);
        header.checksum2 = U32::new(c2);
        header
    }

    fn compute_checksum(&self, data: &[u8]) -> (u32, u32) {
        checksum(&[&self.as_bytes()[..16], data])
    }

    fn verify(&self, data: &[u8]) -> bool {
        self.compute_checksum(data) == (self.checksum1.get(), self.checksum2.get())
    }

    be_getters! {
        page_no: u32,
        commit_size: u32,
        salt1: u32,
        salt2: u32,
    }

    pub fn is_commit(&self) -> bool {
        self.commit_size.get() != 0
    }
}

/// Two-accumulator checksum over a sequence of byte slices.
pub fn checksum(parts: &[&[u8]]) -> (u32, u32) {
    let mut s1: u32 = 0;
    let mut s2: u32 = 0;
    for part in parts {
        for &b in *part {
            s1 = (s1 + b as u32) % WAL_CHECKSUM_MODULUS;
            s2 = (s2 + s1) % WAL_CHECKSUM_MODULUS;
        }
    }
    (s1, s2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    pub page_no: u32,
    pub commit_size: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryInfo {
    pub frames_verified: u32,
    /// One past the index of the last verified commit frame; 0 when no
    /// commit survived.
    pub last_commit_frame: u32,
}

pub struct Wal {
    file: Box<dyn DatabaseFile>,
    path: Option<PathBuf>,
    page_size: usize,
    header: WalHeader,
    frame_count: u32,
    last_commit_frame: u32,
    recovered: RecoveryInfo,
}

impl Wal {
    /// Opens the WAL at `path`, creating an empty log when the file is
    /// missing or empty. An existing log is recovered before returning.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path, true)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let mut wal = Self::with_file(Box::new(file), page_size)?;
        wal.path = Some(path.to_path_buf());
        Ok(wal)
    }

    pub fn with_file(file: Box<dyn DatabaseFile>, page_size: usize) -> Result<Self> {
        if file.len()? < WAL_HEADER_SIZE as u64 {
            let header = WalHeader::new(page_size, rand::random(), rand::random());
            file.truncate(0)?;
            file.write_at(0, header.as_bytes())?;
            file.sync()?;

            return Ok(Self {
                file,
                path: None,
                page_size,
                header,
                frame_count: 0,
                last_commit_frame: 0,
                recovered: RecoveryInfo::default(),
            });
        }

        let mut bytes = [0u8; WAL_HEADER_SIZE];
        file.read_at(0, &mut bytes)?;
        let header = WalHeader::from_bytes(&bytes)?;
        ensure!(
            header.page_size() as usize == page_size,
            "WAL page size {} does not match database page size {}",
            header.page_size(),
            page_size
        );

        let mut wal = Self {
            file,
            path: None,
            page_size,
            header,
            frame_count: 0,
            last_commit_frame: 0,
            recovered: RecoveryInfo::default(),
        };
        wal.recover()?;
        Ok(wal)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    /// Frames currently in the log, committed or not.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn last_commit_frame(&self) -> u32 {
        self.last_commit_frame
    }

    /// What the most recent `recover` found, before the uncommitted tail was
    /// cut off.
    pub fn recovery_info(&self) -> RecoveryInfo {
        self.recovered
    }

    fn frame_size(&self) -> u64 {
        (WAL_FRAME_HEADER_SIZE + self.page_size) as u64
    }

    fn frame_offset(&self, index: u32) -> u64 {
        WAL_HEADER_SIZE as u64 + index as u64 * self.frame_size()
    }

    /// Appends a frame. A non-zero `commit_size` marks the commit frame of a
    /// transaction and records the database size in pages.
    pub fn write_frame(&mut self, page_no: u32, data: &[u8], commit_size: u32) -> Result<u32> {
        ensure!(page_no != 0, "WAL frame for page 0");
        ensure!(
            data.len() == self.page_size,
            "page data must be exactly {} bytes, got {}",
            self.page_size,
            data.len()
        );

        let header = WalFrameHeader::new(
            page_no,
            commit_size,
            self.header.salt1(),
            self.header.salt2(),
            data,
        );

        let index = self.frame_count;
        let offset = self.frame_offset(index);
        let mut frame = Vec::with_capacity(self.frame_size() as usize);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(data);
        self.file
            .write_at(offset, &frame)
            .wrap_err_with(|| format!("failed to write WAL frame {} for page {}", index, page_no))?;

        self.frame_count += 1;
        if commit_size != 0 {
            self.last_commit_frame = self.frame_count;
        }

        trace!(index, page_no, commit_size, "wrote WAL frame");
        Ok(index)
    }

    /// The durability point: records the frame count in the header and syncs.
    pub fn commit(&mut self) -> Result<()> {
        self.header.set_sequence(self.frame_count);
        self.header.seal();
        self.file
            .write_at(0, self.header.as_bytes())
            .wrap_err("failed to write WAL header")?;
        self.file.sync().wrap_err("failed to sync WAL")?;

        debug!(frames = self.frame_count, "WAL commit");
        Ok(())
    }

    fn read_raw_frame(&self, index: u32) -> Result<Option<(WalFrameHeader, Vec<u8>)>> {
        let offset = self.frame_offset(index);
        if offset + self.frame_size() > self.file.len()? {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.frame_size() as usize];
        self.file
            .read_at(offset, &mut buf)
            .wrap_err_with(|| format!("failed to read WAL frame {}", index))?;

        let data = buf.split_off(WAL_FRAME_HEADER_SIZE);
        let header = WalFrameHeader::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse WalFrameHeader: {:?}", e))?;
        Ok(Some((header, data)))
    }

    fn frame_is_valid(&self, header: &WalFrameHeader, data: &[u8]) -> bool {
        header.salt1() == self.header.salt1()
            && header.salt2() == self.header.salt2()
            && header.page_no() != 0
            && header.verify(data)
    }

    /// Reads and verifies frame `index`.
    pub fn read_frame(&self, index: u32) -> Result<WalFrame> {
        ensure!(
            index < self.frame_count,
            "WAL frame {} out of range ({} frames)",
            index,
            self.frame_count
        );

        let Some((header, data)) = self.read_raw_frame(index)? else {
            bail!(StorageError::Corrupt(format!("WAL frame {} is truncated", index)));
        };
        if !self.frame_is_valid(&header, &data) {
            bail!(StorageError::Corrupt(format!(
                "WAL frame {} failed checksum verification",
                index
            )));
        }

        Ok(WalFrame {
            page_no: header.page_no(),
            commit_size: header.commit_size(),
            data,
        })
    }

    /// Scans frames from the start and stops at the first that fails
    /// verification.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn recover(&mut self) -> Result<RecoveryInfo> {
        let mut info = RecoveryInfo::default();

        let mut index = 0u32;
        while let Some((header, data)) = self.read_raw_frame(index)? {
            if !self.frame_is_valid(&header, &data) {
                warn!(index, page_no = header.page_no(), "WAL frame rejected during recovery");
                break;
            }

            index += 1;
            info.frames_verified = index;
            if header.is_commit() {
                info.last_commit_frame = index;
            }
        }

        self.frame_count = info.frames_verified;
        self.last_commit_frame = info.last_commit_frame;
        self.recovered = info;
        self.discard_uncommitted()?;

        debug!(
            frames_verified = info.frames_verified,
            last_commit_frame = info.last_commit_frame,
            "WAL recovery complete"
        );
        Ok(info)
    }

    /// Drops every frame after the last commit so the next transaction
    /// appends directly behind committed history.
    pub fn discard_uncommitted(&mut self) -> Result<()> {
        self.rewind(self.last_commit_frame)
    }

    /// Cuts the log back to its first `frames` frames, forgetting any commit
    /// recorded past that point.
    pub fn rewind(&mut self, frames: u32) -> Result<()> {
        ensure!(
            frames <= self.frame_count,
            "cannot rewind WAL to frame {} ({} frames)",
            frames,
            self.frame_count
        );

        let keep = self.frame_offset(frames);
        if self.file.len()? > keep {
            warn!(
                from = self.frame_count,
                to = frames,
                "discarding WAL frames past the last commit"
            );
            self.file
                .truncate(keep)
                .wrap_err("failed to truncate WAL")?;
            self.file.sync()?;
        }
        self.frame_count = frames;
        self.last_commit_frame = self.last_commit_frame.min(frames);
        Ok(())
    }

    /// Latest committed image of every page, plus the database size recorded
    /// by the last commit.
    pub fn committed_pages(&self) -> Result<(BTreeMap<u32, Vec<u8>>, u32)> {
        let mut pages = BTreeMap::new();
        let mut db_size = 0;

        for index in 0..self.last_commit_frame {
            let frame = self.read_frame(index)?;
            if frame.commit_size != 0 {
                db_size = frame.commit_size;
            }
            pages.insert(frame.page_no, frame.data);
        }
        Ok((pages, db_size))
    }

    /// Copies committed pages into the database and resets the log.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn checkpoint(&mut self, pager: &PageManager) -> Result<usize> {
        ensure!(
            pager.page_size() == self.page_size,
            "WAL page size {} does not match database page size {}",
            self.page_size,
            pager.page_size()
        );

        let (pages, db_size) = self.committed_pages()?;
        let applied = pages.len();

        for (page_no, data) in &pages {
            pager.restore_page(*page_no, data)?;
        }
        if db_size != 0 && db_size != pager.num_pages() {
            pager.update_header(|h| h.set_database_size(db_size))?;
        }
        pager.sync()?;

        self.reset()?;
        debug!(pages = applied, "WAL checkpoint complete");
        Ok(applied)
    }

    fn reset(&mut self) -> Result<()> {
        let salt1 = self.header.salt1().wrapping_add(1);
        self.header = WalHeader::new(self.page_size, salt1, rand::random());

        self.file.truncate(WAL_HEADER_SIZE as u64)?;
        self.file
            .write_at(0, self.header.as_bytes())
            .wrap_err("failed to write WAL header")?;
        self.file.sync()?;

        self.frame_count = 0;
        self.last_commit_frame = 0;
        Ok(())
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("frame_count", &self.frame_count)
            .field("last_commit_frame", &self.last_commit_frame)
            .finish()
    }
}
