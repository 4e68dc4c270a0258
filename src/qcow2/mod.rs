//! The QCOW2 storage engine: an [`Image`] ties the header, refcount
//! engine, allocator, address translator, caches, and consistency/lifecycle
//! machinery of the other modules in this crate into the library surface
//! described in spec §6.

pub mod allocator;
pub mod barrier;
pub mod bitmap;
pub mod cache;
pub mod codec;
pub mod entries;
pub mod header;
pub mod lock;
pub mod refcount;
pub mod snapshot;
pub mod translate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::backend::{StdFileBackend, StorageBackend};
use crate::disk::{BackingSource, RawDisk};
use crate::error::{DiskError, Result};

use allocator::Allocator;
use barrier::{BarrierMode, Barriers};
use bitmap::BitmapEntry;
use cache::{BufferPool, ShardedCache, DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY};
use codec::{CodecFactory, CompressionCodec, SectorCodec};
use entries::ClusterType;
use header::Header;
use lock::ClusterLockPool;
use refcount::RefcountEngine;
use snapshot::SnapshotRecord;
use translate::L2Cache;

/// Options consumed by [`Image::create`], mirroring library-surface §6.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub size: u64,
    pub cluster_bits: u32,
    pub version: u32,
    pub refcount_order: u32,
    pub lazy_refcounts: bool,
    pub backing_path: Option<String>,
    pub backing_format: Option<String>,
    pub external_data_path: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            size: 0,
            cluster_bits: 16,
            version: 3,
            refcount_order: 4,
            lazy_refcounts: false,
            backing_path: None,
            backing_format: None,
            external_data_path: None,
        }
    }
}

/// Open-mode flags, per library-surface §6 (`open`/`open_readonly`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read_only: bool,
}

impl OpenFlags {
    pub fn read_write() -> Self {
        OpenFlags { read_only: false }
    }

    pub fn read_only() -> Self {
        OpenFlags { read_only: true }
    }
}

/// Mode for [`Image::write_zero_at`], per spec §4.5 "zero-write" modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroMode {
    /// Drop any existing data cluster; the L2 entry carries `ZERO` alone.
    Plain,
    /// Preserve the host offset, set `ZERO` + `COPIED`; a later write must
    /// clear `ZERO` before the stale bytes could ever be observed.
    Alloc,
}

/// The report shape shared by `check()` and `repair()` (library-surface §6).
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub leaks: u64,
    pub corruptions: u64,
    pub errors: Vec<String>,
    pub allocated: u64,
    pub referenced: u64,
    pub fragmented: u64,
}

const MAX_BACKING_DEPTH: usize = 64;

struct L1State {
    offset: u64,
    table: Vec<u64>,
}

struct SnapshotState {
    records: Vec<SnapshotRecord>,
    next_id: u64,
}

/// A live handle to an open QCOW2 image (data model §3).
///
/// Every field that a read needs is reachable through `&self`: the L1
/// table and refcount table sit behind `RwLock`s, the shared-resource
/// pools (caches, allocator, cluster locks, barrier state) manage their
/// own interior mutability. This lets callers share one `Image` across
/// threads behind an `Arc` and get the concurrency model of spec §5 for
/// free — concurrent reads, writes to distinct virtual clusters running
/// in parallel, writes to the same virtual cluster serialised by the
/// cluster lock pool.
pub struct Image {
    path: Option<PathBuf>,
    read_only: bool,
    backend: Mutex<Box<dyn StorageBackend>>,
    external: Option<Mutex<Box<dyn StorageBackend>>>,
    backing: Option<Mutex<Box<dyn BackingSource>>>,

    header: RwLock<Header>,
    l1: RwLock<L1State>,
    refcounts: Mutex<RefcountEngine>,
    rc_cache: refcount::RefcountBlockCache,
    l2_cache: L2Cache,
    compressed_cache: ShardedCache<u64, Vec<u8>>,
    allocator: Mutex<Allocator>,
    locks: ClusterLockPool,
    barriers: Mutex<Barriers>,
    buffer_pool: BufferPool,

    codec: RwLock<Option<Box<dyn SectorCodec>>>,
    codec_factory: RwLock<Option<Box<dyn CodecFactory>>>,
    compression: RwLock<Option<CompressionCodec>>,

    snapshots: Mutex<SnapshotState>,
    bitmaps: Mutex<Vec<BitmapEntry>>,

    first_write_done: AtomicBool,
}

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

impl Image {
    // ---------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------

    /// Creates a new image at `path` per `options`.
    pub fn create(path: impl AsRef<Path>, options: &CreateOptions) -> Result<Self> {
        let backend = StdFileBackend::create(path.as_ref())?;
        let mut image = Self::create_in(Box::new(backend), options)?;
        image.path = Some(path.as_ref().to_path_buf());
        Ok(image)
    }

    /// Creates a new image over an arbitrary backend (used directly by
    /// tests against [`crate::backend::MemBackend`]).
    pub fn create_in(mut backend: Box<dyn StorageBackend>, options: &CreateOptions) -> Result<Self> {
        if !(9..=21).contains(&options.cluster_bits) {
            return Err(DiskError::invalid_format("cluster_bits out of range"));
        }
        if options.version != 2 && options.version != 3 {
            return Err(DiskError::invalid_format("version must be 2 or 3"));
        }
        if options.version == 2 && options.refcount_order != 4 {
            return Err(DiskError::invalid_format("v2 images always use 16-bit refcounts"));
        }
        if options.refcount_order > 6 {
            return Err(DiskError::invalid_format("refcount_order out of range"));
        }

        let cluster_size = 1u64 << options.cluster_bits;
        let l2_entry_size = 8u64;
        let l2_entries = cluster_size / l2_entry_size;
        let l1_size = translate::min_l1_size(options.size, cluster_size, l2_entries).max(1) as u32;
        let l1_clusters = (l1_size as u64 * 8).div_ceil(cluster_size).max(1);

        backend.set_len(0)?;
        let header_cluster = 0u64;
        let l1_offset = cluster_size; // cluster 1
        let rc_table_offset = align_up(cluster_size + l1_clusters * cluster_size, cluster_size);
        let rc_entries_per_cluster = cluster_size / 8;
        backend.set_len(rc_table_offset + cluster_size)?;

        let mut refcounts = RefcountEngine::new(
            vec![0u64; rc_entries_per_cluster as usize],
            rc_table_offset,
            options.cluster_bits,
            options.refcount_order,
        );
        let rc_cache: refcount::RefcountBlockCache = ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY);

        // Account for every metadata cluster laid out so far: header, L1
        // table range, and the refcount table's own (single, initial)
        // cluster, per spec §3's "every metadata cluster ... has refcount
        // >= 1".
        refcounts.increment(backend.as_mut(), &rc_cache, header_cluster)?;
        for i in 0..l1_clusters {
            refcounts.increment(backend.as_mut(), &rc_cache, l1_offset / cluster_size + i)?;
        }
        let rc_table_clusters = (rc_table_offset + cluster_size).div_ceil(cluster_size) - rc_table_offset / cluster_size;
        for i in 0..rc_table_clusters {
            refcounts.increment(backend.as_mut(), &rc_cache, rc_table_offset / cluster_size + i)?;
        }

        backend.write_at(l1_offset, &vec![0u8; (l1_clusters * cluster_size) as usize])?;

        let mut incompatible = 0u64;
        let mut compatible = 0u64;
        let mut extensions = HashMap::new();
        let mut backing_file_offset = 0u64;
        let mut backing_file_size = 0u32;

        if options.lazy_refcounts {
            compatible |= header::COMPAT_LAZY_REFCOUNTS;
        }
        if let Some(backing) = &options.backing_path {
            let bytes = backing.as_bytes();
            let bf_off = align_up(backend.len()?, 8);
            backend.set_len(bf_off + bytes.len() as u64)?;
            backend.write_at(bf_off, bytes)?;
            backing_file_offset = bf_off;
            backing_file_size = bytes.len() as u32;
            if let Some(fmt) = &options.backing_format {
                extensions.insert(header::EXT_BACKING_FORMAT, fmt.as_bytes().to_vec());
            }
        }
        if let Some(ext_path) = &options.external_data_path {
            incompatible |= header::INCOMPAT_EXTERNAL_DATA_FILE;
            extensions.insert(header::EXT_DATA_FILE_NAME, ext_path.as_bytes().to_vec());
        }

        let header_length = if options.version == 3 {
            header::V3_HEADER_LEN
        } else {
            header::V2_HEADER_LEN
        };

        let header = Header {
            version: options.version,
            size: options.size,
            cluster_bits: options.cluster_bits,
            l1_size,
            l1_table_offset: l1_offset,
            refcount_table_offset: refcounts.table_offset(),
            refcount_table_clusters: refcounts.table_clusters() as u32,
            crypt_method: 0,
            backing_file_offset,
            backing_file_size,
            refcount_order: options.refcount_order,
            incompatible_features: incompatible,
            compatible_features: compatible,
            autoclear_features: 0,
            header_length,
            extensions,
        };
        header.write(backend.as_mut())?;
        backend.flush()?;

        let external = match &options.external_data_path {
            Some(p) => {
                let resolved = resolve_relative(None, p);
                Some(Mutex::new(Box::new(StdFileBackend::create(resolved)?) as Box<dyn StorageBackend>))
            }
            None => None,
        };

        let image = Image {
            path: None,
            read_only: false,
            backend: Mutex::new(backend),
            external,
            backing: None,
            header: RwLock::new(header),
            l1: RwLock::new(L1State {
                offset: l1_offset,
                table: vec![0u64; l1_size as usize],
            }),
            refcounts: Mutex::new(refcounts),
            rc_cache,
            l2_cache: ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY),
            compressed_cache: ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY),
            allocator: Mutex::new(Allocator::new()),
            locks: ClusterLockPool::default(),
            barriers: Mutex::new(Barriers::new(BarrierMode::default())),
            buffer_pool: BufferPool::new(cluster_size as usize),
            codec: RwLock::new(None),
            codec_factory: RwLock::new(None),
            compression: RwLock::new(None),
            snapshots: Mutex::new(SnapshotState {
                records: Vec::new(),
                next_id: 0,
            }),
            bitmaps: Mutex::new(Vec::new()),
            first_write_done: AtomicBool::new(false),
        };
        tracing::debug!(size = options.size, cluster_bits = options.cluster_bits, "image created");
        Ok(image)
    }

    // ---------------------------------------------------------------
    // Opening
    // ---------------------------------------------------------------

    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let mut visited = Vec::new();
        Self::open_with_chain(path.as_ref(), flags, &mut visited, 0)
    }

    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, OpenFlags::read_only())
    }

    fn open_with_chain(
        path: &Path,
        flags: OpenFlags,
        visited: &mut Vec<PathBuf>,
        depth: usize,
    ) -> Result<Self> {
        if depth > MAX_BACKING_DEPTH {
            return Err(DiskError::BackingChainTooDeep);
        }
        let canon = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        if visited.contains(&canon) {
            return Err(DiskError::BackingChainCycle);
        }
        visited.push(canon);

        let backend: Box<dyn StorageBackend> = if flags.read_only {
            Box::new(StdFileBackend::open_readonly(path)?)
        } else {
            Box::new(StdFileBackend::open(path)?)
        };
        let mut image = Self::open_in(backend, flags)?;
        image.path = Some(path.to_path_buf());

        if image.header.read().unwrap().backing_file_offset != 0 {
            let (name, fmt) = image.read_backing_name()?;
            let backing_path = resolve_relative(path.parent(), &name);
            let backing = if fmt.as_deref() == Some("raw") || !looks_like_qcow2(&backing_path) {
                let raw_backend = StdFileBackend::open_readonly(&backing_path)?;
                Box::new(RawDisk::new(raw_backend)?) as Box<dyn BackingSource>
            } else {
                let child = Self::open_with_chain(&backing_path, OpenFlags::read_only(), visited, depth + 1)?;
                Box::new(child) as Box<dyn BackingSource>
            };
            image.backing = Some(Mutex::new(backing));
        }
        Ok(image)
    }

    /// Opens an already-positioned backend (no backing-chain resolution —
    /// callers that need the chain go through [`Image::open`]).
    pub fn open_in(mut backend: Box<dyn StorageBackend>, flags: OpenFlags) -> Result<Self> {
        let header = Header::read(backend.as_mut())?;
        if header.is_corrupt() && !flags.read_only {
            // A corrupt image is read-only regardless of open mode (spec
            // §4.1), so we still open it, just force read-only below.
        }
        let read_only = flags.read_only || header.is_corrupt();

        let cluster_size = header.cluster_size();
        if header.has_extended_l2() {
            tracing::warn!("extended L2 image opened; subcluster writes are unsupported");
        }

        let mut l1_buf = vec![0u8; header.l1_size as usize * 8];
        backend.read_at(header.l1_table_offset, &mut l1_buf)?;
        let l1_table: Vec<u64> = l1_buf
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        let rc_entries = (header.refcount_table_clusters as u64 * cluster_size / 8) as usize;
        let mut rc_buf = vec![0u8; rc_entries * 8];
        backend.read_at(header.refcount_table_offset, &mut rc_buf)?;
        let rc_table: Vec<u64> = rc_buf
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        let refcounts = RefcountEngine::new(rc_table, header.refcount_table_offset, header.cluster_bits, header.refcount_order);
        let rc_cache: refcount::RefcountBlockCache = ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY);

        let external = if header.has_external_data_file() {
            let name = header
                .external_data_file_name()
                .ok_or_else(|| DiskError::invalid_format("external data file bit set without a name"))?;
            check_no_nul(&name)?;
            Some(Mutex::new(Box::new(StdFileBackend::open(resolve_relative(None, &name))?) as Box<dyn StorageBackend>))
        } else {
            None
        };

        let mut snapshots = Vec::new();
        if let Some(raw) = header.extensions.get(&header::EXT_SNAPSHOT_DIR) {
            snapshots = snapshot::parse_directory(raw)?;
        }
        let next_id = snapshots.iter().map(|s| s.id + 1).max().unwrap_or(0);

        let mut bitmaps = Vec::new();
        if let Some(raw) = header.extensions.get(&header::EXT_BITMAPS) {
            bitmaps = bitmap::parse_directory(raw)?;
        }

        let dirty = header.is_dirty();
        let lazy = header.is_lazy_refcounts();

        let image = Image {
            path: None,
            read_only,
            backend: Mutex::new(backend),
            external,
            backing: None,
            header: RwLock::new(header),
            l1: RwLock::new(L1State {
                offset: 0,
                table: l1_table,
            }),
            refcounts: Mutex::new(refcounts),
            rc_cache,
            l2_cache: ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY),
            compressed_cache: ShardedCache::new(DEFAULT_SHARDS, DEFAULT_SHARD_CAPACITY),
            allocator: Mutex::new(Allocator::new()),
            locks: ClusterLockPool::default(),
            barriers: Mutex::new(Barriers::new(BarrierMode::default())),
            buffer_pool: BufferPool::new(cluster_size as usize),
            codec: RwLock::new(None),
            codec_factory: RwLock::new(None),
            compression: RwLock::new(None),
            snapshots: Mutex::new(SnapshotState {
                records: snapshots,
                next_id,
            }),
            bitmaps: Mutex::new(bitmaps),
            first_write_done: AtomicBool::new(false),
        };
        // L1 offset lives inside `header`, re-sync the duplicate we keep
        // alongside the in-memory table for fast access.
        image.l1.write().unwrap().offset = image.header.read().unwrap().l1_table_offset;

        for entry in image.bitmaps.lock().unwrap().iter() {
            if entry.in_use() {
                tracing::warn!(name = %entry.name, "persistent bitmap found IN_USE at open");
            }
        }

        if dirty && lazy && !read_only {
            tracing::warn!("dirty image with lazy refcounts; rebuilding refcounts");
            image.rebuild_refcounts()?;
        }

        Ok(image)
    }

    fn read_backing_name(&self) -> Result<(String, Option<String>)> {
        let header = self.header.read().unwrap();
        let mut buf = vec![0u8; header.backing_file_size as usize];
        self.backend.lock().unwrap().read_at(header.backing_file_offset, &mut buf)?;
        let name = String::from_utf8_lossy(&buf).to_string();
        check_no_nul(&name)?;
        Ok((name, header.backing_format_name()))
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn size(&self) -> u64 {
        self.header.read().unwrap().size
    }

    pub fn cluster_size(&self) -> u64 {
        self.header.read().unwrap().cluster_size()
    }

    pub fn header(&self) -> Header {
        self.header.read().unwrap().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.header.read().unwrap().is_dirty()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn barrier_mode(&self) -> BarrierMode {
        self.barriers.lock().unwrap().mode()
    }

    pub fn set_barrier_mode(&self, mode: BarrierMode) {
        self.barriers.lock().unwrap().set_mode(mode);
    }

    pub fn install_codec_factory(&self, factory: Box<dyn CodecFactory>) {
        *self.codec_factory.write().unwrap() = Some(factory);
    }

    pub fn install_compression_codec(&self, codec: CompressionCodec) {
        *self.compression.write().unwrap() = Some(codec);
    }

    /// Derives and installs a [`SectorCodec`] from `password` using the
    /// installed [`CodecFactory`] and the header's encryption region.
    pub fn set_password(&self, password: &str) -> Result<()> {
        let header = self.header.read().unwrap();
        let (offset, length) = header.crypto_header().ok_or(DiskError::Encrypted)?;
        let mut region = vec![0u8; length as usize];
        self.backend.lock().unwrap().read_at(offset, &mut region)?;
        drop(header);
        let factory = self.codec_factory.read().unwrap();
        let factory = factory.as_ref().ok_or(DiskError::Encrypted)?;
        let codec = factory.derive(password, &region)?;
        *self.codec.write().unwrap() = Some(codec);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Helpers shared by read/write paths
    // ---------------------------------------------------------------

    fn cluster_bits(&self) -> u32 {
        self.header.read().unwrap().cluster_bits
    }

    fn l2_layout(&self) -> (u32, u64, bool) {
        let h = self.header.read().unwrap();
        (h.l2_bits(), h.l2_entry_size(), h.has_extended_l2())
    }

    /// The backend that guest data clusters live in: the external data
    /// file when one is configured, the main file otherwise (spec §4.3
    /// "target file discipline").
    fn with_data_backend<R>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> Result<R>) -> Result<R> {
        if let Some(ext) = &self.external {
            f(ext.lock().unwrap().as_mut())
        } else {
            f(self.backend.lock().unwrap().as_mut())
        }
    }

    fn with_main_backend<R>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> Result<R>) -> Result<R> {
        f(self.backend.lock().unwrap().as_mut())
    }

    fn flush_main(&self) -> Result<()> {
        self.backend.lock().unwrap().flush()
    }

    fn flush_data(&self) -> Result<()> {
        if let Some(ext) = &self.external {
            ext.lock().unwrap().flush()
        } else {
            self.flush_main()
        }
    }

    fn sync_header_fields(&self) {
        let mut header = self.header.write().unwrap();
        let refcounts = self.refcounts.lock().unwrap();
        let l1 = self.l1.read().unwrap();
        header.refcount_table_offset = refcounts.table_offset();
        header.refcount_table_clusters = refcounts.table_clusters() as u32;
        header.l1_table_offset = l1.offset;
        header.l1_size = l1.table.len() as u32;
    }

    fn persist_header(&self) -> Result<()> {
        self.sync_header_fields();
        let header = self.header.read().unwrap();
        self.with_main_backend(|b| header.write(b))
    }

    fn barrier_data(&self) -> Result<()> {
        if self.barriers.lock().unwrap().should_sync_on_data_write() {
            self.flush_data()?;
        }
        Ok(())
    }

    fn barrier_metadata(&self) -> Result<()> {
        if self.barriers.lock().unwrap().should_sync_on_metadata_write() {
            self.flush_main()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.persist_header()?;
        self.with_main_backend(|b| b.flush())?;
        if let Some(ext) = &self.external {
            ext.lock().unwrap().flush()?;
        }
        self.barriers.lock().unwrap().force_flush(self.backend.lock().unwrap().as_mut())?;
        Ok(())
    }

    /// Clean shutdown: flushes pending state and, for a write-opened v3
    /// image, clears the dirty bit (unless lazy-refcounts mode wants it
    /// left set to force a rebuild on next open).
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if !self.read_only {
            self.flush()?;
            let lazy = self.header.read().unwrap().is_lazy_refcounts();
            if self.header.read().unwrap().version == 3 && !lazy {
                self.header.write().unwrap().incompatible_features &= !header::INCOMPAT_DIRTY;
                self.persist_header()?;
                self.with_main_backend(|b| b.flush())?;
            }
        }
        Ok(())
    }

    fn note_first_write(&self) -> Result<()> {
        if self.first_write_done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.read_only && self.header.read().unwrap().version == 3 {
            self.header.write().unwrap().incompatible_features |= header::INCOMPAT_DIRTY;
        }
        // Every persistent bitmap that claims to be consistent must be
        // marked IN_USE before this mutation's barrier (spec §3 invariant,
        // §4.5 step 9).
        let mut bitmaps = self.bitmaps.lock().unwrap();
        for b in bitmaps.iter_mut() {
            b.flags |= bitmap::FLAG_IN_USE;
        }
        // Persisted unconditionally, even with zero bitmaps configured:
        // the dirty bit set above must reach disk before the data write
        // that follows (spec §4.7), not only as a side effect of a
        // bitmap's IN_USE flag flipping.
        self.persist_bitmap_directory(&bitmaps)?;
        self.barrier_metadata()?;
        Ok(())
    }

    fn persist_bitmap_directory(&self, entries: &[BitmapEntry]) -> Result<()> {
        let payload = bitmap::serialize_directory(entries)?;
        self.header.write().unwrap().extensions.insert(header::EXT_BITMAPS, payload);
        self.persist_header()
    }

    fn persist_snapshot_directory(&self, records: &[SnapshotRecord]) -> Result<()> {
        let payload = snapshot::serialize_directory(records);
        self.header.write().unwrap().extensions.insert(header::EXT_SNAPSHOT_DIR, payload);
        self.persist_header()
    }

    fn mark_bitmaps_dirty_range(&self, offset: u64, len: u64) -> Result<()> {
        let bitmaps = self.bitmaps.lock().unwrap();
        for b in bitmaps.iter() {
            if b.auto() {
                self.with_main_backend(|backend| b.mark_range_dirty(backend, offset, len))?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // L1 table access
    // ---------------------------------------------------------------

    /// Grows the in-memory and on-disk L1 table so it covers `l1_index`,
    /// relocating it to a fresh cluster range in the main file (spec §8's
    /// "L1 growth" boundary behaviour). Metadata allocation, so always the
    /// main file.
    fn ensure_l1_capacity(&self, l1_index: u64) -> Result<()> {
        let mut l1 = self.l1.write().unwrap();
        if (l1_index as usize) < l1.table.len() {
            return Ok(());
        }
        let cluster_size = self.cluster_size();
        let new_len = (l1_index as usize + 1).next_power_of_two().max(l1.table.len() + 1);
        let mut new_table = l1.table.clone();
        new_table.resize(new_len, 0);

        let new_clusters = (new_len as u64 * 8).div_ceil(cluster_size);
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        let lazy = self.header.read().unwrap().is_lazy_refcounts();
        let mut offsets = Vec::with_capacity(new_clusters as usize);
        self.with_main_backend(|backend| {
            for _ in 0..new_clusters {
                offsets.push(allocator.allocate_main(backend, &mut refcounts, &self.rc_cache, cluster_size, lazy)?);
            }
            Ok(())
        })?;
        // A freshly grown L1 table must occupy a contiguous cluster run so
        // a single offset + length describes it; bail out to a corrupt
        // error rather than silently mis-describing the table if the
        // allocator ever hands back a non-contiguous run (can't happen
        // with the current append-mostly allocator, but cheap to check).
        for w in offsets.windows(2) {
            if w[1] != w[0] + cluster_size {
                return Err(DiskError::corrupt("L1 table relocation produced a non-contiguous cluster run"));
            }
        }
        let new_offset = offsets[0];
        let mut buf = vec![0u8; (new_clusters * cluster_size) as usize];
        for (i, &e) in new_table.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&e.to_be_bytes());
        }
        self.with_main_backend(|b| b.write_at(new_offset, &buf))?;

        let old_offset = l1.offset;
        let old_clusters = (l1.table.len() as u64 * 8).div_ceil(cluster_size).max(1);
        l1.offset = new_offset;
        l1.table = new_table;
        drop(l1);
        drop(refcounts);
        drop(allocator);
        self.barrier_metadata()?;

        if old_offset != 0 {
            let mut refcounts = self.refcounts.lock().unwrap();
            let mut allocator = self.allocator.lock().unwrap();
            self.with_main_backend(|backend| {
                for i in 0..old_clusters {
                    let idx = old_offset / cluster_size + i;
                    if refcounts.decrement(backend, &self.rc_cache, idx)? == 0 {
                        allocator.mark_free(idx);
                    }
                }
                Ok(())
            })?;
        }
        tracing::debug!(new_len, "L1 table grown and relocated");
        Ok(())
    }

    fn read_l1_entry(&self, l1_index: u64) -> u64 {
        let l1 = self.l1.read().unwrap();
        l1.table.get(l1_index as usize).copied().unwrap_or(0)
    }

    /// Ensures the L2 table reachable from `l1_index` exists and is
    /// exclusively owned (refcount == 1, `COPIED` set), per spec §4.5
    /// step 2. Returns its host offset.
    fn ensure_l2_table(&self, l1_index: u64) -> Result<u64> {
        self.ensure_l1_capacity(l1_index)?;
        let cluster_size = self.cluster_size();
        let entry = self.read_l1_entry(l1_index);

        if !entries::l1_is_allocated(entry) {
            let mut refcounts = self.refcounts.lock().unwrap();
            let mut allocator = self.allocator.lock().unwrap();
            let lazy = self.header.read().unwrap().is_lazy_refcounts();
            let new_offset = self.with_main_backend(|backend| {
                let off = allocator.allocate_main(backend, &mut refcounts, &self.rc_cache, cluster_size, lazy)?;
                backend.write_at(off, &vec![0u8; cluster_size as usize])?;
                Ok(off)
            })?;
            drop(refcounts);
            drop(allocator);
            self.barrier_metadata()?;
            self.l1.write().unwrap().table[l1_index as usize] = entries::l1_entry(new_offset, true);
            self.persist_l1_entry(l1_index)?;
            self.barrier_metadata()?;
            return Ok(new_offset);
        }

        let offset = entries::l1_offset(entry);
        if entries::l1_copied(entry) {
            return Ok(offset);
        }

        let cluster_index = offset / cluster_size;
        let refcount = {
            let mut refcounts = self.refcounts.lock().unwrap();
            self.with_main_backend(|backend| refcounts.read(backend, &self.rc_cache, cluster_index))?
        };
        if refcount <= 1 {
            self.l1.write().unwrap().table[l1_index as usize] = entries::l1_entry(offset, true);
            self.persist_l1_entry(l1_index)?;
            return Ok(offset);
        }

        // Shared L2 table: copy-on-write it.
        let mut old_bytes = vec![0u8; cluster_size as usize];
        self.with_main_backend(|b| b.read_at(offset, &mut old_bytes))?;
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        let lazy = self.header.read().unwrap().is_lazy_refcounts();
        let new_offset = self.with_main_backend(|backend| {
            let off = allocator.allocate_main(backend, &mut refcounts, &self.rc_cache, cluster_size, lazy)?;
            backend.write_at(off, &old_bytes)?;
            Ok(off)
        })?;
        if refcounts.decrement(self.backend.lock().unwrap().as_mut(), &self.rc_cache, cluster_index)? == 0 {
            allocator.mark_free(cluster_index);
        }
        drop(refcounts);
        drop(allocator);
        self.barrier_metadata()?;
        self.l1.write().unwrap().table[l1_index as usize] = entries::l1_entry(new_offset, true);
        self.persist_l1_entry(l1_index)?;
        self.l2_cache.invalidate(&offset);
        self.barrier_metadata()?;
        tracing::debug!(l1_index, old = offset, new = new_offset, "L2 table copy-on-write");
        Ok(new_offset)
    }

    fn persist_l1_entry(&self, l1_index: u64) -> Result<()> {
        let (l1_offset, entry) = {
            let l1 = self.l1.read().unwrap();
            (l1.offset, l1.table[l1_index as usize])
        };
        self.with_main_backend(|b| b.write_at(l1_offset + l1_index * 8, &entry.to_be_bytes()))
    }

    fn read_l2_table(&self, l2_table_offset: u64) -> Result<Vec<u8>> {
        if let Some(b) = self.l2_cache.get(&l2_table_offset) {
            return Ok(b);
        }
        let cluster_size = self.cluster_size();
        let mut buf = vec![0u8; cluster_size as usize];
        self.with_main_backend(|b| b.read_at(l2_table_offset, &mut buf))?;
        self.l2_cache.put(l2_table_offset, buf.clone());
        Ok(buf)
    }

    fn persist_l2_entry(&self, l2_table_offset: u64, l2_index: u64, entry_size: u64, word0: u64) -> Result<()> {
        let off = l2_table_offset + l2_index * entry_size;
        self.with_main_backend(|b| b.write_at(off, &word0.to_be_bytes()))?;
        self.l2_cache.invalidate(&l2_table_offset);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        self.read_at_data(&mut buf[..len], offset)?;
        Ok(len)
    }

    /// Reads `buf` fully, with no virtual-size clamping — used both by the
    /// public [`Image::read_at`] and by this image acting as a backing
    /// source for a child image.
    fn read_at_data(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let cluster_size = self.cluster_size();
        let cluster_bits = self.cluster_bits();
        let (l2_bits, entry_size, extended) = self.l2_layout();
        let mut done = 0usize;
        while done < buf.len() {
            let vo = offset + done as u64;
            let intra = translate::intra_cluster_offset(vo, cluster_bits);
            let seg_len = ((cluster_size - intra) as usize).min(buf.len() - done);
            self.read_segment(vo, intra, &mut buf[done..done + seg_len], cluster_bits, l2_bits, entry_size, extended)?;
            done += seg_len;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn read_segment(
        &self,
        vo: u64,
        intra: u64,
        out: &mut [u8],
        cluster_bits: u32,
        l2_bits: u32,
        entry_size: u64,
        extended: bool,
    ) -> Result<()> {
        let t = {
            let l1 = self.l1.read().unwrap();
            self.with_main_backend(|backend| {
                translate::translate(&l1.table, backend, &self.l2_cache, cluster_bits, l2_bits, entry_size, extended, vo)
            })?
        };

        let mut cluster_type = t.cluster_type;
        if let Some((bitmaps, sub)) = t.subclusters {
            cluster_type = if !bitmaps.is_allocated(sub) {
                ClusterType::Unallocated
            } else if bitmaps.is_zero(sub) {
                ClusterType::Zero
            } else {
                match cluster_type {
                    ClusterType::Normal(off) => ClusterType::Normal(off),
                    other => other,
                }
            };
        }

        match cluster_type {
            ClusterType::Unallocated => {
                if let Some(backing) = &self.backing {
                    backing.lock().unwrap().read_at(vo, out)?;
                } else {
                    out.fill(0);
                }
            }
            ClusterType::Zero => out.fill(0),
            ClusterType::ZeroAllocated(_) => out.fill(0),
            ClusterType::Normal(host_offset) => {
                self.with_data_backend(|b| b.read_at(host_offset + intra, out))?;
                self.decrypt_in_place(host_offset, intra, out)?;
            }
            ClusterType::Compressed { host_offset, sectors } => {
                let key = host_offset ^ (sectors << 48);
                let cluster_size = self.cluster_size() as usize;
                let decompressed = if let Some(cached) = self.compressed_cache.get(&key) {
                    cached
                } else {
                    let mut payload = vec![0u8; (sectors * entries::SECTOR_SIZE) as usize];
                    self.with_main_backend(|b| b.read_at(host_offset, &mut payload))?;
                    let codec = self.compression.read().unwrap();
                    let codec = codec.as_ref().ok_or_else(|| DiskError::corrupt("compressed cluster with no codec installed"))?;
                    let bytes = codec.decompress(&payload, cluster_size)?;
                    if bytes.len() != cluster_size {
                        return Err(DiskError::corrupt("decompressed cluster has wrong length"));
                    }
                    self.compressed_cache.put(key, bytes.clone());
                    bytes
                };
                let intra = intra as usize;
                out.copy_from_slice(&decompressed[intra..intra + out.len()]);
            }
        }
        Ok(())
    }

    fn decrypt_in_place(&self, host_offset: u64, intra: u64, buf: &mut [u8]) -> Result<()> {
        let codec = self.codec.read().unwrap();
        let Some(codec) = codec.as_ref() else { return Ok(()) };
        let sector_size = codec.sector_size();
        let mut pos = 0u64;
        let base_sector = (host_offset + intra) / sector_size;
        let first_skew = (host_offset + intra) % sector_size;
        debug_assert_eq!(first_skew, 0, "encrypted reads must be sector-aligned");
        while pos < buf.len() as u64 {
            let n = sector_size.min(buf.len() as u64 - pos) as usize;
            codec.decrypt_sector(base_sector + pos / sector_size, &mut buf[pos as usize..pos as usize + n])?;
            pos += n as u64;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        let size = self.size();
        if offset.checked_add(buf.len() as u64).map(|e| e > size).unwrap_or(true) {
            return Err(DiskError::OffsetOutOfRange);
        }
        self.note_first_write()?;

        let cluster_size = self.cluster_size();
        let cluster_bits = self.cluster_bits();
        let mut done = 0usize;
        while done < buf.len() {
            let vo = offset + done as u64;
            let intra = translate::intra_cluster_offset(vo, cluster_bits);
            let seg_len = ((cluster_size - intra) as usize).min(buf.len() - done);
            self.write_segment(vo, intra, &buf[done..done + seg_len])?;
            done += seg_len;
        }
        self.mark_bitmaps_dirty_range(offset, buf.len() as u64)?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if self.header.read().unwrap().is_corrupt() {
            return Err(DiskError::corrupt("image is marked corrupt"));
        }
        if self.header.read().unwrap().has_extended_l2() {
            return Err(DiskError::unsupported("subcluster writes on extended L2 images"));
        }
        Ok(())
    }

    /// Writes one cluster-bounded segment (`intra + data.len() <=
    /// cluster_size`), implementing the full step sequence of spec §4.5.
    fn write_segment(&self, vo: u64, intra: u64, data: &[u8]) -> Result<()> {
        let cluster_bits = self.cluster_bits();
        let (l2_bits, entry_size, _extended) = self.l2_layout();
        let cluster_size = self.cluster_size();
        let (l1_index, l2_index) = translate::locate(vo, cluster_bits, l2_bits);

        let _guard = self.locks.lock(l1_index, l2_index);

        let l2_table_offset = self.ensure_l2_table(l1_index)?;
        let table = self.read_l2_table(l2_table_offset)?;
        let word0 = u64::from_be_bytes(table[(l2_index * entry_size) as usize..(l2_index * entry_size) as usize + 8].try_into().unwrap());
        let cluster_type = entries::decode_cluster_type(cluster_bits, word0);

        let full_cluster = intra == 0 && data.len() as u64 == cluster_size;
        let cluster_base = vo - intra;
        let (data_offset, deferred_free) =
            self.ensure_data_cluster(cluster_type, cluster_bits, full_cluster, cluster_base)?;

        let mut plain = if full_cluster {
            data.to_vec()
        } else {
            let mut existing = self.buffer_pool.take();
            self.with_data_backend(|b| b.read_at(data_offset, &mut existing))?;
            self.decrypt_in_place(data_offset, 0, &mut existing)?;
            existing[intra as usize..intra as usize + data.len()].copy_from_slice(data);
            existing
        };
        self.encrypt_in_place(data_offset, &mut plain)?;

        self.with_data_backend(|b| b.write_at(data_offset, &plain))?;
        self.barrier_data()?;
        self.buffer_pool.give_back(plain);

        let new_word0 = entries::l2_entry_normal(data_offset, false, true);
        self.persist_l2_entry(l2_table_offset, l2_index, entry_size, new_word0)?;
        self.barrier_metadata()?;

        // Only now is the new L2 entry durable: reclaiming the old
        // compressed payload's clusters before this point would let a
        // crash leave the on-disk L2 entry pointing at a cluster whose
        // on-disk refcount has already dropped to 0 (or been reused), a
        // `Corruption` rather than the benign leak the format tolerates.
        if let Some((first_cluster, last_cluster)) = deferred_free {
            self.free_cluster_range(first_cluster, last_cluster)?;
        }
        Ok(())
    }

    /// Decrements the refcount of every cluster in `[first, last]` and
    /// marks each one free in the allocator bitmap once its count reaches
    /// zero. Used to reclaim a superseded cluster range only after the
    /// metadata that stopped referencing it is durable.
    fn free_cluster_range(&self, first_cluster: u64, last_cluster: u64) -> Result<()> {
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        self.with_main_backend(|backend| {
            for c in first_cluster..=last_cluster {
                if refcounts.decrement(backend, &self.rc_cache, c)? == 0 {
                    allocator.mark_free(c);
                }
            }
            Ok(())
        })
    }

    fn encrypt_in_place(&self, host_offset: u64, buf: &mut [u8]) -> Result<()> {
        let codec = self.codec.read().unwrap();
        let Some(codec) = codec.as_ref() else { return Ok(()) };
        let sector_size = codec.sector_size();
        let base_sector = host_offset / sector_size;
        let mut pos = 0u64;
        while pos < buf.len() as u64 {
            let n = sector_size.min(buf.len() as u64 - pos) as usize;
            codec.encrypt_sector(base_sector + pos / sector_size, &mut buf[pos as usize..pos as usize + n])?;
            pos += n as u64;
        }
        Ok(())
    }

    /// Resolves the pre-existing `cluster_type` at a write target into a
    /// concrete, exclusively-owned data-cluster host offset, applying COW,
    /// zero-alloc clearing, and compressed-cluster rewrite as needed (spec
    /// §4.5 step 3's four cases).
    /// Returns the resolved data-cluster host offset plus, when the
    /// previous cluster must be reclaimed, the `(first, last)` host
    /// cluster-index range the caller should free only after its own
    /// metadata barrier makes the new pointer durable (see `write_segment`).
    fn ensure_data_cluster(
        &self,
        cluster_type: ClusterType,
        cluster_bits: u32,
        full_cluster_overwrite: bool,
        cluster_base_vo: u64,
    ) -> Result<(u64, Option<(u64, u64)>)> {
        let cluster_size = 1u64 << cluster_bits;
        match cluster_type {
            ClusterType::Compressed { host_offset, sectors } => {
                if self.header.read().unwrap().has_external_data_file() {
                    return Err(DiskError::unsupported("compressed cluster rewrite on an external-data-file image"));
                }
                let payload_len = sectors * entries::SECTOR_SIZE;
                let mut payload = vec![0u8; payload_len as usize];
                self.with_main_backend(|b| b.read_at(host_offset, &mut payload))?;
                let codec = self.compression.read().unwrap();
                let codec = codec.as_ref().ok_or_else(|| DiskError::corrupt("compressed cluster with no codec installed"))?;
                let decompressed = codec.decompress(&payload, cluster_size as usize)?;
                drop(codec);

                let new_offset = self.allocate_data_cluster()?;
                self.with_data_backend(|b| b.write_at(new_offset, &decompressed))?;

                let first_cluster = host_offset / cluster_size;
                let last_cluster = (host_offset + payload_len - 1) / cluster_size;
                Ok((new_offset, Some((first_cluster, last_cluster))))
            }
            ClusterType::ZeroAllocated(host_offset) => {
                if !full_cluster_overwrite {
                    // Logically zero, but the physical bytes may be stale
                    // leftovers from before this cluster went zero-alloc;
                    // zero them for real before patching in user bytes.
                    self.with_data_backend(|b| b.write_at(host_offset, &vec![0u8; cluster_size as usize]))?;
                }
                Ok((host_offset, None))
            }
            ClusterType::Normal(host_offset) => {
                let cluster_index = self.data_cluster_index(host_offset);
                let refcount = {
                    let mut refcounts = self.refcounts.lock().unwrap();
                    self.with_main_backend(|backend| refcounts.read(backend, &self.rc_cache, cluster_index))?
                };
                if refcount <= 1 {
                    return Ok((host_offset, None));
                }
                let mut bytes = self.buffer_pool.take();
                self.with_data_backend(|b| b.read_at(host_offset, &mut bytes))?;
                let new_offset = self.allocate_data_cluster()?;
                self.with_data_backend(|b| b.write_at(new_offset, &bytes))?;
                self.buffer_pool.give_back(bytes);
                // Safe to decrement immediately, unlike the `Compressed`
                // case above: `refcount > 1` here means this decrement
                // cannot reach zero, so it can never free a cluster a
                // not-yet-durable L2 entry still (logically) shares.
                let mut refcounts = self.refcounts.lock().unwrap();
                let mut allocator = self.allocator.lock().unwrap();
                if self.with_main_backend(|backend| refcounts.decrement(backend, &self.rc_cache, cluster_index))? == 0 {
                    allocator.mark_free(cluster_index);
                }
                Ok((new_offset, None))
            }
            ClusterType::Unallocated | ClusterType::Zero => {
                let new_offset = self.allocate_data_cluster()?;
                if !full_cluster_overwrite {
                    // An unallocated segment backed only by zero still gets
                    // a zero filler; one with a backing chain must be
                    // primed with the predecessor's bytes first so the
                    // caller's partial overlay doesn't clobber data that
                    // should still be visible through this cluster (spec
                    // §4.5 step 3, "Unallocated" case).
                    let mut filler = self.buffer_pool.take();
                    if let (ClusterType::Unallocated, Some(backing)) = (cluster_type, &self.backing) {
                        backing.lock().unwrap().read_at(cluster_base_vo, &mut filler)?;
                    }
                    self.with_data_backend(|b| b.write_at(new_offset, &filler))?;
                    self.buffer_pool.give_back(filler);
                }
                Ok((new_offset, None))
            }
        }
    }

    fn data_cluster_index(&self, host_offset: u64) -> u64 {
        host_offset / self.cluster_size()
    }

    fn allocate_data_cluster(&self) -> Result<u64> {
        let cluster_size = self.cluster_size();
        let has_external = self.external.is_some();
        let lazy = self.header.read().unwrap().is_lazy_refcounts();
        let mut allocator = self.allocator.lock().unwrap();
        if has_external {
            let off = self.external.as_ref().unwrap().lock().unwrap().as_mut().len()?;
            let aligned = align_up(off, cluster_size);
            let mut ext = self.external.as_ref().unwrap().lock().unwrap();
            ext.set_len(aligned + cluster_size)?;
            Ok(aligned)
        } else {
            let mut refcounts = self.refcounts.lock().unwrap();
            self.with_main_backend(|backend| allocator.allocate_main(backend, &mut refcounts, &self.rc_cache, cluster_size, lazy))
        }
    }

    // ---------------------------------------------------------------
    // Zero writes
    // ---------------------------------------------------------------

    pub fn write_zero_at(&self, offset: u64, len: u64, mode: ZeroMode) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_writable()?;
        let size = self.size();
        if offset.checked_add(len).map(|e| e > size).unwrap_or(true) {
            return Err(DiskError::OffsetOutOfRange);
        }
        self.note_first_write()?;

        let cluster_size = self.cluster_size();
        let cluster_bits = self.cluster_bits();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let intra = translate::intra_cluster_offset(pos, cluster_bits);
            let remaining_in_cluster = cluster_size - intra;
            let remaining_total = end - pos;
            if intra == 0 && remaining_total >= cluster_size {
                self.zero_whole_cluster(pos, mode)?;
                pos += cluster_size;
            } else {
                let n = remaining_in_cluster.min(remaining_total) as usize;
                let zeros = vec![0u8; n];
                self.write_at(&zeros, pos)?;
                pos += n as u64;
            }
        }
        self.mark_bitmaps_dirty_range(offset, len)?;
        Ok(())
    }

    fn zero_whole_cluster(&self, vo: u64, mode: ZeroMode) -> Result<()> {
        let cluster_bits = self.cluster_bits();
        let cluster_size = 1u64 << cluster_bits;
        let (l2_bits, entry_size, _) = self.l2_layout();
        let (l1_index, l2_index) = translate::locate(vo, cluster_bits, l2_bits);
        let _guard = self.locks.lock(l1_index, l2_index);

        let l2_table_offset = self.ensure_l2_table(l1_index)?;
        let table = self.read_l2_table(l2_table_offset)?;
        let word0 = u64::from_be_bytes(table[(l2_index * entry_size) as usize..(l2_index * entry_size) as usize + 8].try_into().unwrap());
        let cluster_type = entries::decode_cluster_type(cluster_bits, word0);

        let mut deferred_free = None;
        let new_word0 = match mode {
            ZeroMode::Plain => {
                if let ClusterType::Normal(host_offset) | ClusterType::ZeroAllocated(host_offset) = cluster_type {
                    let idx = self.data_cluster_index(host_offset);
                    let mut refcounts = self.refcounts.lock().unwrap();
                    let mut allocator = self.allocator.lock().unwrap();
                    if self.with_main_backend(|backend| refcounts.decrement(backend, &self.rc_cache, idx))? == 0 {
                        allocator.mark_free(idx);
                    }
                } else if let ClusterType::Compressed { host_offset, sectors } = cluster_type {
                    // As in `ensure_data_cluster`'s `Compressed` arm, the old
                    // payload's clusters must not be reclaimed until the L2
                    // entry that stops pointing at them is durable.
                    let payload_len = sectors * entries::SECTOR_SIZE;
                    let first_cluster = host_offset / cluster_size;
                    let last_cluster = (host_offset + payload_len - 1) / cluster_size;
                    deferred_free = Some((first_cluster, last_cluster));
                }
                entries::l2_entry_normal(0, true, false)
            }
            ZeroMode::Alloc => {
                let host_offset = match cluster_type {
                    ClusterType::Normal(off) | ClusterType::ZeroAllocated(off) => off,
                    ClusterType::Compressed { host_offset, sectors } => {
                        let payload_len = sectors * entries::SECTOR_SIZE;
                        let first_cluster = host_offset / cluster_size;
                        let last_cluster = (host_offset + payload_len - 1) / cluster_size;
                        deferred_free = Some((first_cluster, last_cluster));
                        self.allocate_data_cluster()?
                    }
                    ClusterType::Unallocated | ClusterType::Zero => self.allocate_data_cluster()?,
                };
                self.barrier_data()?;
                entries::l2_entry_normal(host_offset, true, true)
            }
        };
        self.persist_l2_entry(l2_table_offset, l2_index, entry_size, new_word0)?;
        self.barrier_metadata()?;

        if let Some((first_cluster, last_cluster)) = deferred_free {
            self.free_cluster_range(first_cluster, last_cluster)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Consistency & repair
    // ---------------------------------------------------------------

    /// Recomputes every refcount from scratch by walking metadata roots
    /// (spec §4.2 "Rebuild").
    pub fn rebuild_refcounts(&self) -> Result<()> {
        let cluster_size = self.cluster_size();
        let (_, l2_entry_size, _) = self.l2_layout();
        let mut refcounts = self.refcounts.lock().unwrap();
        self.with_main_backend(|b| refcounts.zero_all(b, &self.rc_cache))?;

        let bump = |backend: &mut dyn StorageBackend, refcounts: &mut RefcountEngine, idx: u64| -> Result<()> {
            refcounts.increment(backend, &self.rc_cache, idx)?;
            Ok(())
        };

        self.with_main_backend(|backend| {
            bump(backend, &mut refcounts, 0)?; // header cluster

            let l1 = self.l1.read().unwrap();
            let l1_clusters = (l1.table.len() as u64 * 8).div_ceil(cluster_size).max(1);
            for i in 0..l1_clusters {
                bump(backend, &mut refcounts, l1.offset / cluster_size + i)?;
            }

            let rc_table_clusters = refcounts.table_clusters();
            let rc_table_offset = refcounts.table_offset();
            for i in 0..rc_table_clusters {
                bump(backend, &mut refcounts, rc_table_offset / cluster_size + i)?;
            }

            for &l1_entry in l1.table.iter() {
                if !entries::l1_is_allocated(l1_entry) {
                    continue;
                }
                let l2_offset = entries::l1_offset(l1_entry);
                bump(backend, &mut refcounts, l2_offset / cluster_size)?;
                bump_l2_table_data_refs(
                    backend,
                    &mut refcounts,
                    &self.rc_cache,
                    l2_offset,
                    cluster_size,
                    self.cluster_bits(),
                    l2_entry_size,
                )?;
            }

            let snapshots = self.snapshots.lock().unwrap();
            for snap in &snapshots.records {
                let snap_clusters = (snap.l1_size as u64 * 8).div_ceil(cluster_size).max(1);
                for i in 0..snap_clusters {
                    bump(backend, &mut refcounts, snap.l1_table_offset / cluster_size + i)?;
                }
                let mut buf = vec![0u8; snap.l1_size as usize * 8];
                backend.read_at(snap.l1_table_offset, &mut buf)?;
                for chunk in buf.chunks_exact(8) {
                    let e = u64::from_be_bytes(chunk.try_into().unwrap());
                    if entries::l1_is_allocated(e) {
                        let l2_offset = entries::l1_offset(e);
                        bump(backend, &mut refcounts, l2_offset / cluster_size)?;
                        bump_l2_table_data_refs(
                            backend,
                            &mut refcounts,
                            &self.rc_cache,
                            l2_offset,
                            cluster_size,
                            self.cluster_bits(),
                            l2_entry_size,
                        )?;
                    }
                }
            }
            Ok(())
        })?;

        drop(refcounts);
        self.allocator.lock().unwrap().invalidate();
        self.header.write().unwrap().incompatible_features &= !header::INCOMPAT_DIRTY;
        self.first_write_done.store(false, Ordering::SeqCst);
        self.persist_header()?;
        tracing::warn!("refcounts rebuilt");
        Ok(())
    }

    pub fn check(&self) -> Result<CheckReport> {
        let cluster_size = self.cluster_size();
        let (_, l2_entry_size, _) = self.l2_layout();
        let mut expected: HashMap<u64, u64> = HashMap::new();
        let mut bump = |idx: u64| *expected.entry(idx).or_insert(0) += 1;

        bump(0);
        let l1 = self.l1.read().unwrap();
        let l1_clusters = (l1.table.len() as u64 * 8).div_ceil(cluster_size).max(1);
        for i in 0..l1_clusters {
            bump(l1.offset / cluster_size + i);
        }

        let mut errors = Vec::new();
        let file_len = self.with_main_backend(|b| b.len())?;
        let file_clusters = file_len.div_ceil(cluster_size);

        {
            let refcounts = self.refcounts.lock().unwrap();
            let rc_clusters = refcounts.table_clusters();
            let rc_offset = refcounts.table_offset();
            for i in 0..rc_clusters {
                bump(rc_offset / cluster_size + i);
            }
        }

        self.with_main_backend(|backend| {
            for &l1_entry in l1.table.iter() {
                if !entries::l1_is_allocated(l1_entry) {
                    continue;
                }
                let l2_offset = entries::l1_offset(l1_entry);
                if l2_offset % cluster_size != 0 || l2_offset / cluster_size >= file_clusters {
                    errors.push(format!("L1 entry points outside file: {l2_offset:#x}"));
                    return Ok(());
                }
                bump(l2_offset / cluster_size);
                check_l2_table(
                    backend,
                    l2_offset,
                    cluster_size,
                    self.cluster_bits(),
                    l2_entry_size,
                    file_clusters,
                    &mut expected,
                    &mut errors,
                );
            }
            Ok(())
        })?;

        let corruptions_from_structure = errors.len() as u64;

        let mut leaks = 0u64;
        let mut corruptions = corruptions_from_structure;
        let mut allocated = 0u64;
        let mut referenced = 0u64;
        let mut fragmented = 0u64;
        let mut prev_allocated: Option<u64> = None;

        let refcounts_snapshot = self.refcounts.lock().unwrap();
        self.with_main_backend(|backend| {
            for idx in 0..file_clusters {
                let actual = refcounts_snapshot.read(backend, &self.rc_cache, idx)?;
                let exp = expected.get(&idx).copied().unwrap_or(0);
                if actual > 0 {
                    allocated += 1;
                    if let Some(p) = prev_allocated {
                        if idx != p + 1 {
                            fragmented += 1;
                        }
                    }
                    prev_allocated = Some(idx);
                }
                referenced += exp;
                if actual > exp {
                    leaks += 1;
                    errors.push(format!("cluster {idx} leaked: refcount {actual} but {exp} references"));
                } else if exp > actual {
                    corruptions += 1;
                    errors.push(format!("cluster {idx} under-counted: {exp} references but refcount {actual}"));
                }
            }
            Ok(())
        })?;

        Ok(CheckReport {
            leaks,
            corruptions,
            errors,
            allocated,
            referenced,
            fragmented,
        })
    }

    /// Rebuilds refcounts (which reclaims leaked clusters as a side
    /// effect, since anything unreachable is never bumped back up) and
    /// returns the post-repair report.
    pub fn repair(&self) -> Result<CheckReport> {
        self.rebuild_refcounts()?;
        self.check()
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.snapshots.lock().unwrap().records.clone()
    }

    pub fn create_snapshot(&self, name: &str) -> Result<SnapshotRecord> {
        self.check_writable()?;
        let cluster_size = self.cluster_size();
        let mut l1 = self.l1.write().unwrap();
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut state = self.snapshots.lock().unwrap();
        let record = self.with_main_backend(|backend| {
            snapshot::create_snapshot(name, &mut state.next_id, &mut l1.table, cluster_size, backend, &mut refcounts, &self.rc_cache)
        })?;
        state.records.push(record.clone());
        let records = state.records.clone();
        drop(state);
        drop(refcounts);
        drop(l1);
        self.persist_l1_table()?;
        self.barrier_metadata()?;
        self.persist_snapshot_directory(&records)?;
        self.barrier_metadata()?;
        Ok(record)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let cluster_size = self.cluster_size();
        let mut state = self.snapshots.lock().unwrap();
        let idx = state
            .records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| DiskError::corrupt(format!("no such snapshot: {name}")))?;
        let record = state.records.remove(idx);
        let records = state.records.clone();
        drop(state);

        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        self.with_main_backend(|backend| {
            snapshot::delete_snapshot(&record, cluster_size, backend, &mut refcounts, &self.rc_cache, &mut allocator)
        })?;
        drop(refcounts);
        drop(allocator);
        self.persist_snapshot_directory(&records)?;
        self.barrier_metadata()?;
        Ok(())
    }

    pub fn revert_to_snapshot(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let cluster_size = self.cluster_size();
        let state = self.snapshots.lock().unwrap();
        let record = state
            .records
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| DiskError::corrupt(format!("no such snapshot: {name}")))?;
        drop(state);

        let mut l1 = self.l1.write().unwrap();
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        self.with_main_backend(|backend| {
            snapshot::revert_to_snapshot(&record, &mut l1.table, cluster_size, backend, &mut refcounts, &self.rc_cache, &mut allocator)
        })?;
        drop(refcounts);
        drop(allocator);
        drop(l1);
        self.l2_cache.clear();
        self.persist_l1_table()?;
        self.barrier_metadata()?;
        Ok(())
    }

    /// Reads from the image as it existed at the time `snapshot` was
    /// taken, without disturbing the live L1 table.
    pub fn read_at_snapshot(&self, buf: &mut [u8], offset: u64, snapshot: &str) -> Result<usize> {
        let record = {
            let state = self.snapshots.lock().unwrap();
            state
                .records
                .iter()
                .find(|r| r.name == snapshot)
                .cloned()
                .ok_or_else(|| DiskError::corrupt(format!("no such snapshot: {snapshot}")))?
        };
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let buf = &mut buf[..len];

        let mut snap_l1 = vec![0u8; record.l1_size as usize * 8];
        self.with_main_backend(|b| b.read_at(record.l1_table_offset, &mut snap_l1))?;
        let snap_l1: Vec<u64> = snap_l1.chunks_exact(8).map(|c| u64::from_be_bytes(c.try_into().unwrap())).collect();

        let cluster_bits = self.cluster_bits();
        let (l2_bits, entry_size, extended) = self.l2_layout();
        let cluster_size = self.cluster_size();
        let mut done = 0usize;
        while done < buf.len() {
            let vo = offset + done as u64;
            let intra = translate::intra_cluster_offset(vo, cluster_bits);
            let seg_len = ((cluster_size - intra) as usize).min(buf.len() - done);
            let t = self.with_main_backend(|backend| {
                translate::translate(&snap_l1, backend, &self.l2_cache, cluster_bits, l2_bits, entry_size, extended, vo)
            })?;
            let out = &mut buf[done..done + seg_len];
            match t.cluster_type {
                ClusterType::Unallocated => {
                    if let Some(backing) = &self.backing {
                        backing.lock().unwrap().read_at(vo, out)?;
                    } else {
                        out.fill(0);
                    }
                }
                ClusterType::Zero | ClusterType::ZeroAllocated(_) => out.fill(0),
                ClusterType::Normal(host_offset) => {
                    self.with_data_backend(|b| b.read_at(host_offset + intra, out))?;
                    self.decrypt_in_place(host_offset, intra, out)?;
                }
                ClusterType::Compressed { host_offset, sectors } => {
                    let mut payload = vec![0u8; (sectors * entries::SECTOR_SIZE) as usize];
                    self.with_main_backend(|b| b.read_at(host_offset, &mut payload))?;
                    let codec = self.compression.read().unwrap();
                    let codec = codec.as_ref().ok_or_else(|| DiskError::corrupt("compressed cluster with no codec installed"))?;
                    let decompressed = codec.decompress(&payload, cluster_size as usize)?;
                    out.copy_from_slice(&decompressed[intra as usize..intra as usize + out.len()]);
                }
            }
            done += seg_len;
        }
        Ok(len)
    }

    fn persist_l1_table(&self) -> Result<()> {
        let l1 = self.l1.read().unwrap();
        let mut buf = Vec::with_capacity(l1.table.len() * 8);
        for &e in &l1.table {
            buf.extend_from_slice(&e.to_be_bytes());
        }
        let offset = l1.offset;
        drop(l1);
        self.with_main_backend(|b| b.write_at(offset, &buf))
    }

    // ---------------------------------------------------------------
    // Persistent bitmaps
    // ---------------------------------------------------------------

    pub fn bitmaps(&self) -> Vec<BitmapEntry> {
        self.bitmaps.lock().unwrap().clone()
    }

    pub fn find_bitmap(&self, name: &str) -> Option<BitmapEntry> {
        self.bitmaps.lock().unwrap().iter().find(|b| b.name == name).cloned()
    }

    /// Allocates storage for a new named bitmap and adds it to the
    /// directory, consistent (not `IN_USE`).
    pub fn create_bitmap(&self, name: &str, granularity: u32) -> Result<BitmapEntry> {
        self.check_writable()?;
        if name.len() > bitmap::NAME_MAX {
            return Err(DiskError::invalid_format("bitmap name too long"));
        }
        let bit_count = self.size().div_ceil(granularity as u64).max(1);
        let byte_len = bit_count.div_ceil(8);
        let cluster_size = self.cluster_size();
        let clusters = byte_len.div_ceil(cluster_size).max(1);
        let mut refcounts = self.refcounts.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        let lazy = self.header.read().unwrap().is_lazy_refcounts();
        let mut offset = 0u64;
        self.with_main_backend(|backend| {
            for i in 0..clusters {
                let off = allocator.allocate_main(backend, &mut refcounts, &self.rc_cache, cluster_size, lazy)?;
                if i == 0 {
                    offset = off;
                }
                backend.write_at(off, &vec![0u8; cluster_size as usize])?;
            }
            Ok(())
        })?;
        drop(refcounts);
        drop(allocator);

        let entry = BitmapEntry {
            name: name.to_string(),
            granularity,
            flags: bitmap::FLAG_AUTO,
            bit_table_offset: offset,
            bit_count,
        };
        let mut bitmaps = self.bitmaps.lock().unwrap();
        bitmaps.push(entry.clone());
        self.persist_bitmap_directory(&bitmaps)?;
        self.header.write().unwrap().autoclear_features |= header::AUTOCLEAR_BITMAPS;
        self.persist_header()?;
        Ok(entry)
    }

    pub fn open_bitmap(&self, name: &str) -> Result<BitmapEntry> {
        self.find_bitmap(name).ok_or_else(|| DiskError::corrupt(format!("no such bitmap: {name}")))
    }

    pub fn bitmap_is_set(&self, name: &str, offset: u64) -> Result<bool> {
        let entry = self.open_bitmap(name)?;
        self.with_main_backend(|b| entry.is_set(b, offset))
    }

    pub fn bitmap_dirty_ranges(&self, name: &str) -> Result<Vec<(u64, u64)>> {
        let entry = self.open_bitmap(name)?;
        self.with_main_backend(|b| entry.dirty_ranges(b))
    }
}

#[allow(clippy::too_many_arguments)]
fn bump_l2_table_data_refs(
    backend: &mut dyn StorageBackend,
    refcounts: &mut RefcountEngine,
    cache: &refcount::RefcountBlockCache,
    l2_offset: u64,
    cluster_size: u64,
    cluster_bits: u32,
    l2_entry_size: u64,
) -> Result<()> {
    let mut table = vec![0u8; cluster_size as usize];
    backend.read_at(l2_offset, &mut table)?;
    for chunk in table.chunks_exact(l2_entry_size as usize) {
        let word0 = u64::from_be_bytes(chunk[..8].try_into().unwrap());
        match entries::decode_cluster_type(cluster_bits, word0) {
            ClusterType::Normal(off) | ClusterType::ZeroAllocated(off) => {
                refcounts.increment(backend, cache, off / cluster_size)?;
            }
            ClusterType::Compressed { host_offset, sectors } => {
                let first = host_offset / cluster_size;
                let last = (host_offset + sectors * entries::SECTOR_SIZE - 1) / cluster_size;
                for c in first..=last {
                    refcounts.increment(backend, cache, c)?;
                }
            }
            ClusterType::Unallocated | ClusterType::Zero => {}
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_l2_table(
    backend: &mut dyn StorageBackend,
    l2_offset: u64,
    cluster_size: u64,
    cluster_bits: u32,
    l2_entry_size: u64,
    file_clusters: u64,
    expected: &mut HashMap<u64, u64>,
    errors: &mut Vec<String>,
) {
    let mut table = vec![0u8; cluster_size as usize];
    if backend.read_at(l2_offset, &mut table).is_err() {
        errors.push(format!("failed to read L2 table at {l2_offset:#x}"));
        return;
    }
    for chunk in table.chunks_exact(l2_entry_size as usize) {
        let word0 = u64::from_be_bytes(chunk[..8].try_into().unwrap());
        match entries::decode_cluster_type(cluster_bits, word0) {
            ClusterType::Normal(off) | ClusterType::ZeroAllocated(off) => {
                if off % cluster_size != 0 || off / cluster_size >= file_clusters {
                    errors.push(format!("L2 entry points outside file: {off:#x}"));
                    continue;
                }
                *expected.entry(off / cluster_size).or_insert(0) += 1;
            }
            ClusterType::Compressed { host_offset, sectors } => {
                let first = host_offset / cluster_size;
                let last = (host_offset + sectors * entries::SECTOR_SIZE - 1) / cluster_size;
                for c in first..=last {
                    if c >= file_clusters {
                        errors.push(format!("compressed cluster points outside file: {host_offset:#x}"));
                        break;
                    }
                    *expected.entry(c).or_insert(0) += 1;
                }
            }
            ClusterType::Unallocated | ClusterType::Zero => {}
        }
    }
}

fn check_no_nul(s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(DiskError::invalid_format("null byte in stored path"));
    }
    Ok(())
}

fn resolve_relative(base: Option<&Path>, name: &str) -> PathBuf {
    let p = Path::new(name);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match base {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}

fn looks_like_qcow2(path: &Path) -> bool {
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    use std::io::Read;
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic).is_ok() && u32::from_be_bytes(magic) == header::MAGIC
}

impl BackingSource for Image {
    fn size(&self) -> u64 {
        Image::size(self)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = Image::size(self);
        if offset >= size {
            buf.fill(0);
            return Ok(());
        }
        let avail = size - offset;
        if (buf.len() as u64) <= avail {
            self.read_at_data(buf, offset)
        } else {
            let n = avail as usize;
            self.read_at_data(&mut buf[..n], offset)?;
            buf[n..].fill(0);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn store_identity(plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn restore_identity(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut out = payload.to_vec();
        out.resize(expected_len, 0);
        Ok(out)
    }

    fn new_image(size: u64, cluster_bits: u32) -> Image {
        Image::create_in(
            Box::new(MemBackend::new()),
            &CreateOptions {
                size,
                cluster_bits,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Directly installs a compressed L2 entry for virtual cluster 0,
    /// bypassing the write path (this crate exposes no public way to
    /// produce a compressed cluster — only to read and rewrite one).
    fn install_compressed_cluster(image: &Image, plain: &[u8]) {
        let cluster_bits = image.cluster_bits();
        let cluster_size = image.cluster_size();
        assert_eq!(plain.len() as u64, cluster_size);

        let payload = plain.to_vec(); // "compressed" bytes for the identity codec
        let sectors = payload.len().div_ceil(entries::SECTOR_SIZE as usize) as u64;
        let payload_offset = image.allocate_data_cluster().unwrap();
        image.with_main_backend(|b| b.write_at(payload_offset, &payload)).unwrap();

        let l2_table_offset = image.ensure_l2_table(0).unwrap();
        let (_, entry_size, _) = image.l2_layout();
        let word0 = entries::l2_entry_compressed(cluster_bits, payload_offset, sectors);
        image.persist_l2_entry(l2_table_offset, 0, entry_size, word0).unwrap();
    }

    #[test]
    fn compressed_cluster_reads_decompressed_bytes() {
        let cluster_bits = 16;
        let cluster_size = 1u64 << cluster_bits;
        let image = new_image(cluster_size, cluster_bits);
        image.install_compression_codec(CompressionCodec {
            name: "identity",
            compress: store_identity,
            decompress: restore_identity,
        });

        let plain: Vec<u8> = (0..cluster_size).map(|i| (i % 256) as u8).collect();
        install_compressed_cluster(&image, &plain);

        let mut out = vec![0u8; cluster_size as usize];
        image.read_at(&mut out, 0).unwrap();
        assert_eq!(out, plain);

        // A second read exercises the decompressed-cluster cache path.
        let mut out2 = vec![0u8; 16];
        image.read_at(&mut out2, 100).unwrap();
        assert_eq!(out2, plain[100..116]);
    }

    #[test]
    fn writing_into_a_compressed_cluster_rewrites_it_as_normal() {
        let cluster_bits = 16;
        let cluster_size = 1u64 << cluster_bits;
        let image = new_image(cluster_size, cluster_bits);
        image.install_compression_codec(CompressionCodec {
            name: "identity",
            compress: store_identity,
            decompress: restore_identity,
        });

        let plain: Vec<u8> = (0..cluster_size).map(|i| (i % 256) as u8).collect();
        install_compressed_cluster(&image, &plain);

        image.write_at(b"patched", 10).unwrap();

        let mut out = vec![0u8; cluster_size as usize];
        image.read_at(&mut out, 0).unwrap();
        assert_eq!(&out[10..17], b"patched");
        assert_eq!(&out[..10], &plain[..10]);
        assert_eq!(&out[17..], &plain[17..]);

        let report = image.check().unwrap();
        assert_eq!(report.leaks, 0, "{:?}", report.errors);
        assert_eq!(report.corruptions, 0, "{:?}", report.errors);
    }

    #[test]
    fn zero_alloc_over_compressed_cluster_frees_old_payload() {
        let cluster_bits = 16;
        let cluster_size = 1u64 << cluster_bits;
        let image = new_image(cluster_size, cluster_bits);
        image.install_compression_codec(CompressionCodec {
            name: "identity",
            compress: store_identity,
            decompress: restore_identity,
        });

        let plain: Vec<u8> = (0..cluster_size).map(|i| (i % 256) as u8).collect();
        install_compressed_cluster(&image, &plain);

        image.write_zero_at(0, cluster_size, ZeroMode::Alloc).unwrap();

        let mut out = vec![0xffu8; cluster_size as usize];
        image.read_at(&mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 0));

        let report = image.check().unwrap();
        assert_eq!(report.leaks, 0, "{:?}", report.errors);
        assert_eq!(report.corruptions, 0, "{:?}", report.errors);
    }

    #[test]
    fn plain_zero_over_compressed_cluster_frees_old_payload() {
        let cluster_bits = 16;
        let cluster_size = 1u64 << cluster_bits;
        let image = new_image(cluster_size, cluster_bits);
        image.install_compression_codec(CompressionCodec {
            name: "identity",
            compress: store_identity,
            decompress: restore_identity,
        });

        let plain: Vec<u8> = (0..cluster_size).map(|i| (i % 256) as u8).collect();
        install_compressed_cluster(&image, &plain);

        image.write_zero_at(0, cluster_size, ZeroMode::Plain).unwrap();

        let mut out = vec![0xffu8; cluster_size as usize];
        image.read_at(&mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 0));

        let report = image.check().unwrap();
        assert_eq!(report.leaks, 0, "{:?}", report.errors);
        assert_eq!(report.corruptions, 0, "{:?}", report.errors);
    }

    #[test]
    fn ensure_l2_table_shares_exclusive_ownership_without_cow() {
        let image = new_image(1 << 20, 16);
        let l2_a = image.ensure_l2_table(0).unwrap();
        let l2_b = image.ensure_l2_table(0).unwrap();
        assert_eq!(l2_a, l2_b, "re-ensuring an already-exclusive L2 table must not relocate it");
    }

    #[test]
    fn shared_l2_table_is_copied_on_write_after_snapshot() {
        let cluster_size = 1u64 << 16;
        let image = new_image(cluster_size * 4, 16);
        let before = image.ensure_l2_table(0).unwrap();
        image.create_snapshot("s0").unwrap();
        let after = image.ensure_l2_table(0).unwrap();
        assert_ne!(before, after, "a shared L2 table must be copy-on-written");
    }
}
