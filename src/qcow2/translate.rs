//! Virtual-to-host address translation via L1/L2 (component §4.4).

use crate::backend::StorageBackend;
use crate::error::{DiskError, Result};
use crate::qcow2::cache::ShardedCache;
use crate::qcow2::entries::{self, ClusterType, SubclusterBitmaps};

pub type L2Cache = ShardedCache<u64, Vec<u8>>;

/// `(l1_index, l2_index)` for a virtual offset, per the derived constants
/// in spec §3.
pub fn locate(vo: u64, cluster_bits: u32, l2_bits: u32) -> (u64, u64) {
    let l1_index = vo >> (cluster_bits + l2_bits);
    let l2_index = (vo >> cluster_bits) & ((1u64 << l2_bits) - 1);
    (l1_index, l2_index)
}

pub fn intra_cluster_offset(vo: u64, cluster_bits: u32) -> u64 {
    vo & ((1u64 << cluster_bits) - 1)
}

fn load_l2_table(
    backend: &mut dyn StorageBackend,
    cache: &L2Cache,
    host_offset: u64,
    cluster_size: u64,
) -> Result<Vec<u8>> {
    if let Some(bytes) = cache.get(&host_offset) {
        return Ok(bytes);
    }
    let mut buf = vec![0u8; cluster_size as usize];
    backend.read_at(host_offset, &mut buf)?;
    cache.put(host_offset, buf.clone());
    Ok(buf)
}

fn read_entry_word(table: &[u8], index: u64, entry_size: u64) -> u64 {
    let off = (index * entry_size) as usize;
    u64::from_be_bytes(table[off..off + 8].try_into().unwrap())
}

/// Result of translating a virtual offset: the decoded cluster type, plus
/// the subcluster bitmaps and index when the image uses extended L2
/// entries (`None` otherwise).
pub struct Translation {
    pub cluster_type: ClusterType,
    pub l1_index: u64,
    pub l2_index: u64,
    pub l2_table_offset: u64,
    pub subclusters: Option<(SubclusterBitmaps, u32)>,
}

/// Translates a virtual offset to its cluster type, reading the L2 table
/// through `cache` on a miss. `l1_table` is the image's full in-memory L1
/// table.
#[allow(clippy::too_many_arguments)]
pub fn translate(
    l1_table: &[u64],
    backend: &mut dyn StorageBackend,
    cache: &L2Cache,
    cluster_bits: u32,
    l2_bits: u32,
    l2_entry_size: u64,
    extended_l2: bool,
    vo: u64,
) -> Result<Translation> {
    let (l1_index, l2_index) = locate(vo, cluster_bits, l2_bits);
    if l1_index as usize >= l1_table.len() {
        return Ok(Translation {
            cluster_type: ClusterType::Unallocated,
            l1_index,
            l2_index,
            l2_table_offset: 0,
            subclusters: None,
        });
    }
    let l1_entry = l1_table[l1_index as usize];
    if !entries::l1_is_allocated(l1_entry) {
        return Ok(Translation {
            cluster_type: ClusterType::Unallocated,
            l1_index,
            l2_index,
            l2_table_offset: 0,
            subclusters: None,
        });
    }
    let l2_table_offset = entries::l1_offset(l1_entry);
    let cluster_size = 1u64 << cluster_bits;
    let table = load_l2_table(backend, cache, l2_table_offset, cluster_size)?;

    let word0 = read_entry_word(&table, l2_index, l2_entry_size);
    let cluster_type = entries::decode_cluster_type(cluster_bits, word0);

    let subclusters = if extended_l2 && !entries::l2_is_compressed(word0) {
        let off = (l2_index * l2_entry_size) as usize + 8;
        let word1 = u64::from_be_bytes(table[off..off + 8].try_into().unwrap());
        let bitmaps = SubclusterBitmaps::from_word(word1);
        let subcluster_size = cluster_size / 32;
        let intra = intra_cluster_offset(vo, cluster_bits);
        let subcluster = (intra / subcluster_size) as u32;
        Some((bitmaps, subcluster))
    } else {
        None
    };

    Ok(Translation {
        cluster_type,
        l1_index,
        l2_index,
        l2_table_offset,
        subclusters,
    })
}

/// Validates that `l1_size` covers at least `ceil(size / (cluster_size *
/// l2_entries))` entries, per the header invariant in spec §3.
pub fn min_l1_size(size: u64, cluster_size: u64, l2_entries: u64) -> u64 {
    size.div_ceil(cluster_size).div_ceil(l2_entries.max(1))
}

pub fn check_l1_coverage(l1_size: u32, size: u64, cluster_size: u64, l2_entries: u64) -> Result<()> {
    let min = min_l1_size(size, cluster_size, l2_entries);
    if (l1_size as u64) < min {
        return Err(DiskError::invalid_format("l1_size too small for virtual size"));
    }
    Ok(())
}
