//! Raw cache file wrapper
//!
//! Offset-addressed synchronous read/write over a `std::fs::File`.
//! Interior mutex so callers can share one handle per on-disk file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

/// A cache file addressable by byte offset
pub struct CacheFile {
    file: Mutex<File>,
    path: PathBuf,
}

impl CacheFile {
    /// Open an existing file for read/write
    pub fn open(path: &Path) -> Result<CacheFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(CacheFile {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Open a file, creating it if missing
    pub fn open_or_create(path: &Path) -> Result<CacheFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(CacheFile {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Read exactly `buf.len()` bytes starting at `offset`
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write all of `buf` starting at `offset`, extending if needed
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Truncate or extend the file to `length` bytes
    pub fn set_length(&self, length: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(length)?;
        Ok(())
    }

    /// Current file length in bytes
    pub fn length(&self) -> Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    /// Flush pending writes to the OS
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }

    /// Path this handle was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }
}
