//! Snapshot metadata: L1 duplication and L2-table refcount sharing (spec
//! §3, §4.7).
//!
//! Creating a snapshot never copies L2 tables or data clusters — only the
//! L1 table bytes are duplicated, and every L2 table the live L1
//! transitively reaches gets one more reference.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::StorageBackend;
use crate::error::{DiskError, Result};
use crate::qcow2::allocator::Allocator;
use crate::qcow2::entries;
use crate::qcow2::refcount::{RefcountBlockCache, RefcountEngine};

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub name: String,
    pub id: u64,
    pub creation_time: u64,
    pub l1_table_offset: u64,
    pub l1_size: u32,
}

/// Duplicates `live_l1` into a fresh cluster range, shares ownership of
/// every L2 table it reaches, and clears `COPIED` on those live L1 entries
/// (they are no longer exclusively owned once the snapshot exists).
pub fn create_snapshot(
    name: &str,
    next_id: &mut u64,
    live_l1: &mut [u64],
    cluster_size: u64,
    backend: &mut dyn StorageBackend,
    refcounts: &mut RefcountEngine,
    rc_cache: &RefcountBlockCache,
) -> Result<SnapshotRecord> {
    let needed_bytes = live_l1.len() as u64 * 8;
    let clusters = needed_bytes.div_ceil(cluster_size).max(1);
    let base = align_up(backend.len()?, cluster_size);
    backend.set_len(base + clusters * cluster_size)?;

    for i in 0..clusters {
        let cluster_index = (base + i * cluster_size) / cluster_size;
        refcounts.increment(backend, rc_cache, cluster_index)?;
    }

    let mut buf = vec![0u8; (clusters * cluster_size) as usize];
    for (i, &e) in live_l1.iter().enumerate() {
        buf[i * 8..i * 8 + 8].copy_from_slice(&e.to_be_bytes());
    }
    backend.write_at(base, &buf)?;

    for entry in live_l1.iter_mut() {
        if entries::l1_is_allocated(*entry) {
            let l2_off = entries::l1_offset(*entry);
            refcounts.increment(backend, rc_cache, l2_off / cluster_size)?;
            *entry = entries::l1_entry(l2_off, false);
        }
    }

    let id = *next_id;
    *next_id += 1;
    let creation_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    tracing::warn!(name, id, "snapshot created");

    Ok(SnapshotRecord {
        name: name.to_string(),
        id,
        creation_time,
        l1_table_offset: base,
        l1_size: live_l1.len() as u32,
    })
}

/// Decrements refcounts on every L2 table the snapshot's L1 references,
/// and on the snapshot's own L1 cluster range, freeing any that drop to
/// zero.
pub fn delete_snapshot(
    record: &SnapshotRecord,
    cluster_size: u64,
    backend: &mut dyn StorageBackend,
    refcounts: &mut RefcountEngine,
    rc_cache: &RefcountBlockCache,
    allocator: &mut Allocator,
) -> Result<()> {
    let mut buf = vec![0u8; record.l1_size as usize * 8];
    backend.read_at(record.l1_table_offset, &mut buf)?;
    for i in 0..record.l1_size as usize {
        let e = u64::from_be_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        if entries::l1_is_allocated(e) {
            let idx = entries::l1_offset(e) / cluster_size;
            if refcounts.decrement(backend, rc_cache, idx)? == 0 {
                allocator.mark_free(idx);
            }
        }
    }

    let clusters = (record.l1_size as u64 * 8).div_ceil(cluster_size).max(1);
    let base_idx = record.l1_table_offset / cluster_size;
    for i in 0..clusters {
        let idx = base_idx + i;
        if refcounts.decrement(backend, rc_cache, idx)? == 0 {
            allocator.mark_free(idx);
        }
    }
    tracing::warn!(name = %record.name, "snapshot deleted");
    Ok(())
}

/// Replaces the live L1 table with the snapshot's bytes. Old, exclusively
/// owned live L2 tables that the snapshot does not also reference are
/// freed (their refcount drops to zero); every L2 table the restored L1
/// references gains one more reference, reflecting that the live image now
/// points at it in addition to the snapshot (an explicit strengthening of
/// spec §4.7's "re-increment the L2 refcounts under the new L1" needed to
/// keep the zero-leak invariant across repeated revert cycles; see
/// DESIGN.md).
pub fn revert_to_snapshot(
    record: &SnapshotRecord,
    live_l1: &mut Vec<u64>,
    cluster_size: u64,
    backend: &mut dyn StorageBackend,
    refcounts: &mut RefcountEngine,
    rc_cache: &RefcountBlockCache,
    allocator: &mut Allocator,
) -> Result<()> {
    for &e in live_l1.iter() {
        if entries::l1_is_allocated(e) {
            let idx = entries::l1_offset(e) / cluster_size;
            if refcounts.decrement(backend, rc_cache, idx)? == 0 {
                allocator.mark_free(idx);
            }
        }
    }

    let mut buf = vec![0u8; record.l1_size as usize * 8];
    backend.read_at(record.l1_table_offset, &mut buf)?;
    if buf.len() % 8 != 0 {
        return Err(DiskError::corrupt("snapshot l1 table misaligned"));
    }
    let mut new_l1 = Vec::with_capacity(record.l1_size as usize);
    for chunk in buf.chunks_exact(8) {
        new_l1.push(u64::from_be_bytes(chunk.try_into().unwrap()));
    }

    for &e in &new_l1 {
        if entries::l1_is_allocated(e) {
            let idx = entries::l1_offset(e) / cluster_size;
            refcounts.increment(backend, rc_cache, idx)?;
        }
    }

    *live_l1 = new_l1.into_iter().map(|e| entries::l1_entry(entries::l1_offset(e), false)).collect();
    tracing::warn!(name = %record.name, "reverted to snapshot");
    Ok(())
}

/// Serialises the snapshot directory for the `EXT_SNAPSHOT_DIR` extension:
/// a sequence of fixed records, each `id(u64) | creation_time(u64) |
/// l1_table_offset(u64) | l1_size(u32) | name_len(u16) | pad(u16) | name
/// bytes (padded to 8)`.
pub fn serialize_directory(records: &[SnapshotRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for r in records {
        buf.extend_from_slice(&r.id.to_be_bytes());
        buf.extend_from_slice(&r.creation_time.to_be_bytes());
        buf.extend_from_slice(&r.l1_table_offset.to_be_bytes());
        buf.extend_from_slice(&r.l1_size.to_be_bytes());
        let name_bytes = r.name.as_bytes();
        buf.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        let mut padded = name_bytes.to_vec();
        while padded.len() % 8 != 0 {
            padded.push(0);
        }
        buf.extend_from_slice(&padded);
    }
    buf
}

pub fn parse_directory(buf: &[u8]) -> Result<Vec<SnapshotRecord>> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < buf.len() {
        if buf.len() < cursor + 30 {
            return Err(DiskError::corrupt("truncated snapshot directory record"));
        }
        let id = u64::from_be_bytes(buf[cursor..cursor + 8].try_into().unwrap());
        let creation_time = u64::from_be_bytes(buf[cursor + 8..cursor + 16].try_into().unwrap());
        let l1_table_offset = u64::from_be_bytes(buf[cursor + 16..cursor + 24].try_into().unwrap());
        let l1_size = u32::from_be_bytes(buf[cursor + 24..cursor + 28].try_into().unwrap());
        let name_len = u16::from_be_bytes(buf[cursor + 28..cursor + 30].try_into().unwrap()) as usize;
        cursor += 32;
        let padded_len = name_len.div_ceil(8) * 8;
        if buf.len() < cursor + padded_len {
            return Err(DiskError::corrupt("truncated snapshot directory name"));
        }
        let name = String::from_utf8_lossy(&buf[cursor..cursor + name_len]).to_string();
        cursor += padded_len;
        out.push(SnapshotRecord {
            name,
            id,
            creation_time,
            l1_table_offset,
            l1_size,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::qcow2::cache::ShardedCache;

    #[test]
    fn snapshot_create_preserves_l1_bytes() {
        let cs = 1u64 << 16;
        let mut backend = MemBackend::with_len(cs * 4).unwrap();
        let mut refcounts = RefcountEngine::new(vec![0u64; 4], 0, 16, 4);
        let mut cache: RefcountBlockCache = ShardedCache::new(2, 8);
        let mut live_l1 = vec![entries::l1_entry(cs, true)];
        let mut next_id = 0;

        let rec = create_snapshot(
            "s",
            &mut next_id,
            &mut live_l1,
            cs,
            &mut backend,
            &mut refcounts,
            &mut cache,
        )
        .unwrap();

        assert!(!entries::l1_copied(live_l1[0]));
        assert_eq!(entries::l1_offset(live_l1[0]), cs);

        let mut raw = vec![0u8; 8];
        backend.read_at(rec.l1_table_offset, &mut raw).unwrap();
        assert_eq!(u64::from_be_bytes(raw.try_into().unwrap()), entries::l1_entry(cs, false));
        assert_eq!(refcounts.read(&mut backend, &mut cache, cs / cs).unwrap(), 2);
    }

    #[test]
    fn directory_round_trips() {
        let records = vec![SnapshotRecord {
            name: "s1".to_string(),
            id: 1,
            creation_time: 1000,
            l1_table_offset: 0x20000,
            l1_size: 4,
        }];
        let buf = serialize_directory(&records);
        let parsed = parse_directory(&buf).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "s1");
        assert_eq!(parsed[0].l1_table_offset, 0x20000);
    }
}
