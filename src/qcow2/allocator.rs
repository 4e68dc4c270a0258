//! Free-cluster allocation (component §4.3).
//!
//! Metadata clusters (L2 tables, refcount blocks, L1 table, snapshot L1
//! copies) and plain-mode data clusters are allocated in the main image
//! file and tracked by [`RefcountEngine`]. An external data file, when
//! present, is a pure append target: its clusters are never shared, so no
//! refcount bookkeeping applies to them (see `DESIGN.md`, "external data
//! file refcounts").

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::qcow2::refcount::{RefcountBlockCache, RefcountEngine};

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

#[derive(Default)]
pub struct Allocator {
    /// `Some` once built; index = main-file cluster index, `true` = free.
    free_bitmap: Option<Vec<bool>>,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator { free_bitmap: None }
    }

    /// Allocates one cluster in the main file, incrementing its refcount
    /// before returning. In lazy-refcounts mode the bitmap is never
    /// consulted and allocation always appends (spec §9 "lazy refcounts vs.
    /// bitmap" — a correctness constraint, not a tunable).
    pub fn allocate_main(
        &mut self,
        backend: &mut dyn StorageBackend,
        refcounts: &mut RefcountEngine,
        cache: &RefcountBlockCache,
        cluster_size: u64,
        lazy_refcounts: bool,
    ) -> Result<u64> {
        let offset = if lazy_refcounts {
            self.append_cluster(backend, cluster_size)?
        } else {
            self.ensure_bitmap(backend, refcounts, cache, cluster_size)?;
            match self.take_free_from_bitmap() {
                Some(idx) => idx * cluster_size,
                None => {
                    let off = self.append_cluster(backend, cluster_size)?;
                    if let Some(bitmap) = self.free_bitmap.as_mut() {
                        bitmap.push(false);
                    }
                    off
                }
            }
        };
        let cluster_index = offset / cluster_size;
        refcounts.increment(backend, cache, cluster_index)?;
        tracing::debug!(offset, lazy_refcounts, "cluster allocated in main file");
        Ok(offset)
    }

    /// Allocates one cluster by appending to the external data file.
    pub fn allocate_external(&self, backend: &mut dyn StorageBackend, cluster_size: u64) -> Result<u64> {
        let off = self.append_cluster(backend, cluster_size)?;
        tracing::debug!(offset = off, "cluster allocated in external data file");
        Ok(off)
    }

    fn append_cluster(&self, backend: &mut dyn StorageBackend, cluster_size: u64) -> Result<u64> {
        let len = backend.len()?;
        let aligned = align_up(len, cluster_size);
        backend.set_len(aligned + cluster_size)?;
        Ok(aligned)
    }

    fn ensure_bitmap(
        &mut self,
        backend: &mut dyn StorageBackend,
        refcounts: &mut RefcountEngine,
        cache: &RefcountBlockCache,
        cluster_size: u64,
    ) -> Result<()> {
        if self.free_bitmap.is_some() {
            return Ok(());
        }
        let file_clusters = (backend.len()? / cluster_size) as usize;
        let mut bitmap = vec![false; file_clusters];
        for (i, free) in bitmap.iter_mut().enumerate() {
            *free = refcounts.read(backend, cache, i as u64)? == 0;
        }
        tracing::debug!(file_clusters, "free-cluster bitmap built");
        self.free_bitmap = Some(bitmap);
        Ok(())
    }

    fn take_free_from_bitmap(&mut self) -> Option<u64> {
        let bitmap = self.free_bitmap.as_mut()?;
        let idx = bitmap.iter().position(|&free| free)?;
        bitmap[idx] = false;
        Some(idx as u64)
    }

    /// Marks a cluster as free once its refcount has dropped to zero, so a
    /// later allocation reuses it instead of rescanning or appending.
    pub fn mark_free(&mut self, cluster_index: u64) {
        if let Some(bitmap) = self.free_bitmap.as_mut() {
            if (cluster_index as usize) < bitmap.len() {
                bitmap[cluster_index as usize] = true;
            }
        }
    }

    /// Forces a rebuild of the bitmap on next use (after `repair`, where
    /// refcounts change wholesale).
    pub fn invalidate(&mut self) {
        self.free_bitmap = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::qcow2::cache::ShardedCache;

    #[test]
    fn allocate_main_appends_and_increments_refcount() {
        let mut backend = MemBackend::with_len(0).unwrap();
        let mut refcounts = RefcountEngine::new(vec![0u64; 4], 0, 16, 4);
        let mut cache: RefcountBlockCache = ShardedCache::new(2, 8);
        let mut alloc = Allocator::new();
        let off = alloc
            .allocate_main(&mut backend, &mut refcounts, &mut cache, 1 << 16, false)
            .unwrap();
        assert_eq!(off % (1 << 16), 0);
        assert_eq!(
            refcounts.read(&mut backend, &mut cache, off / (1 << 16)).unwrap(),
            1
        );
    }

    #[test]
    fn freed_cluster_is_reused() {
        let mut backend = MemBackend::with_len(0).unwrap();
        let mut refcounts = RefcountEngine::new(vec![0u64; 4], 0, 16, 4);
        let mut cache: RefcountBlockCache = ShardedCache::new(2, 8);
        let mut alloc = Allocator::new();
        let a = alloc
            .allocate_main(&mut backend, &mut refcounts, &mut cache, 1 << 16, false)
            .unwrap();
        refcounts
            .decrement(&mut backend, &mut cache, a / (1 << 16))
            .unwrap();
        alloc.mark_free(a / (1 << 16));
        let b = alloc
            .allocate_main(&mut backend, &mut refcounts, &mut cache, 1 << 16, false)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn lazy_refcounts_always_appends() {
        let mut backend = MemBackend::with_len(0).unwrap();
        let mut refcounts = RefcountEngine::new(vec![0u64; 4], 0, 16, 4);
        let mut cache: RefcountBlockCache = ShardedCache::new(2, 8);
        let mut alloc = Allocator::new();
        let a = alloc
            .allocate_main(&mut backend, &mut refcounts, &mut cache, 1 << 16, true)
            .unwrap();
        let b = alloc
            .allocate_main(&mut backend, &mut refcounts, &mut cache, 1 << 16, true)
            .unwrap();
        assert_ne!(a, b);
    }
}
