//! Storage backends: the byte-addressable files the engine reads and writes.
//!
//! The engine never assumes a particular transport — the main image file,
//! an external data file, and a backing file are each just a
//! [`StorageBackend`]. Tests exercise the engine entirely against
//! [`MemBackend`]; production code uses [`StdFileBackend`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{DiskError, Result};

/// A flat, resizable byte store addressed by absolute offset.
///
/// `Send` so an `Image` (which holds backends behind a `Mutex`) can itself
/// be shared across threads via `Arc`; the engine still wraps every
/// backend in its own locking for concurrent access (see the cluster lock
/// pool and the L1/refcount-table `RwLock`s) rather than relying on `Sync`.
pub trait StorageBackend: Send {
    /// Current length in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Grow or shrink the backend to exactly `len` bytes. Newly exposed
    /// bytes read as zero.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Read exactly `buf.len()` bytes starting at `offset`. Reads past the
    /// end of an unallocated region must still succeed for backends that
    /// model sparse files (as zero bytes) — the engine relies on this for
    /// headerless allocation gaps.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `buf.len()` bytes at `offset`, growing the backend if
    /// necessary.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Durably order every write issued so far ahead of any future write.
    /// This is the engine's `fsync`-equivalent barrier primitive.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory backend, used by every unit and property test in this crate.
#[derive(Debug, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    /// An empty backend.
    pub fn new() -> Self {
        MemBackend { data: Vec::new() }
    }

    /// A zero-filled backend of exactly `len` bytes.
    pub fn with_len(len: u64) -> Result<Self> {
        Ok(MemBackend {
            data: vec![0u8; len as usize],
        })
    }

    /// Borrow the underlying bytes (tests inspect on-disk layout directly).
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(DiskError::OffsetOutOfRange)?;
        if end > self.data.len() {
            // Sparse read past the logical end reads as zero, matching a
            // freshly `ftruncate`d file on a real filesystem.
            let avail = self.data.len().saturating_sub(start);
            if avail > 0 {
                buf[..avail].copy_from_slice(&self.data[start..]);
            }
            buf[avail..].fill(0);
            return Ok(());
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(DiskError::OffsetOutOfRange)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A `std::fs::File`-backed [`StorageBackend`], used for real image files.
pub struct StdFileBackend {
    file: File,
}

impl StdFileBackend {
    /// Opens an existing file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(StdFileBackend { file })
    }

    /// Opens an existing file read-only.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::options()
            .read(true)
            .open(path)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(StdFileBackend { file })
    }

    /// Creates (or truncates) a file for read-write access.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(StdFileBackend { file })
    }

    /// Wraps an already-open file handle.
    pub fn from_file(file: File) -> Self {
        StdFileBackend { file }
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| DiskError::Io(e.to_string()))?
            .len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| DiskError::Io(e.to_string()))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DiskError::Io(e.to_string()))?;
        self.file
            .read_exact(buf)
            .map_err(|e| DiskError::Io(e.to_string()))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DiskError::Io(e.to_string()))?;
        self.file
            .write_all(buf)
            .map_err(|e| DiskError::Io(e.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| DiskError::Io(e.to_string()))
    }
}
