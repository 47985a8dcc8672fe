//! # Database File Abstraction
//!
//! The page manager and the WAL talk to storage through [`DatabaseFile`], a
//! byte-addressable file with positional reads and writes. Two backends are
//! provided:
//!
//! - [`OsFile`]: a `std::fs::File` using positional I/O (`pread`/`pwrite`
//!   on Unix), so concurrent readers never share a seek cursor
//! - [`MemoryFile`]: a growable in-memory buffer for tests and scratch
//!   databases
//!
//! Closing is `Drop`. Whole-file advisory locking is provided in-process by
//! the lock manager in `transaction`, so the trait carries no lock methods.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

pub trait DatabaseFile: Send + Sync {
    /// Fills `buf` from `offset`. Reading past the end of the file is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Sets the file length, zero-filling on growth.
    fn truncate(&self, len: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug)]
pub struct OsFile {
    file: File,
    path: PathBuf,
}

impl OsFile {
    /// Opens `path` for reading and writing, creating it when `create` is set.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn pread(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn pread(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite(file: &File, mut offset: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

impl DatabaseFile for OsFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        pread(&self.file, offset, buf).wrap_err_with(|| {
            format!(
                "failed to read {} bytes at offset {} from '{}'",
                buf.len(),
                offset,
                self.path.display()
            )
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        pwrite(&self.file, offset, data).wrap_err_with(|| {
            format!(
                "failed to write {} bytes at offset {} to '{}'",
                data.len(),
                offset,
                self.path.display()
            )
        })
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to resize '{}' to {} bytes", self.path.display(), len))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", self.path.display()))?;
        Ok(metadata.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFile {
    data: Mutex<Vec<u8>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatabaseFile for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        ensure!(
            end <= data.len(),
            "read of {} bytes at offset {} past end of file ({} bytes)",
            buf.len(),
            offset,
            data.len()
        );

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }

        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
