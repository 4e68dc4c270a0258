//! Disk-level abstractions shared across the backing chain.
//!
//! A QCOW2 image can recurse into a backing image for unallocated regions.
//! The backing image is either another QCOW2 [`crate::qcow2::Image`] or a
//! flat "raw" byte source. Both are modeled as a small [`BackingSource`]
//! capability rather than an open inheritance hierarchy, per the
//! dynamic-dispatch design note: a closed trait surface, not a class tree.

use crate::backend::StorageBackend;
use crate::error::Result;

/// A read-only source of bytes addressed by *virtual* offset, used as the
/// backing-chain predecessor of a QCOW2 image.
pub trait BackingSource: Send {
    /// Virtual size of the backing source in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`. Reads that would run
    /// past `size()` are clamped by the caller before reaching here.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// A backing file with no format of its own: a flat byte source whose
/// virtual size is simply the file's length, per spec §4.7 ("a raw backing
/// file is treated as a flat byte source with virtual size = file size").
pub struct RawDisk<B> {
    backend: B,
    size: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    /// Wraps `backend`, taking its current length as the virtual size.
    pub fn new(mut backend: B) -> Result<Self> {
        let size = backend.len()?;
        Ok(RawDisk { backend, size })
    }
}

impl<B: StorageBackend + Send> BackingSource for RawDisk<B> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset >= self.size {
            buf.fill(0);
            return Ok(());
        }
        let avail = self.size - offset;
        if (buf.len() as u64) <= avail {
            self.backend.read_at(offset, buf)?;
        } else {
            let n = avail as usize;
            self.backend.read_at(offset, &mut buf[..n])?;
            buf[n..].fill(0);
        }
        Ok(())
    }
}
