//! Userspace QCOW2 virtual-disk storage engine.
//!
//! [`qcow2::Image`] is the entry point: create or open an image file, then
//! read, write, snapshot, and check it through a handle shareable across
//! threads.

pub mod backend;
pub mod disk;
pub mod error;
pub mod qcow2;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use disk::{BackingSource, RawDisk};
pub use error::{DiskError, Result};
pub use qcow2::barrier::BarrierMode;
pub use qcow2::bitmap::BitmapEntry;
pub use qcow2::codec::{CodecFactory, CompressionCodec, SectorCodec};
pub use qcow2::header::Header;
pub use qcow2::snapshot::SnapshotRecord;
pub use qcow2::{CheckReport, CreateOptions, Image, OpenFlags, ZeroMode};
