//! Sharded LRU caches for L2 tables, refcount blocks, and decompressed
//! clusters, plus a cluster-sized scratch-buffer pool (component §4.6).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// A cache keyed by `K` (typically a host offset), sharded by hash to keep
/// contention local to whichever shard a given key lands in.
pub struct ShardedCache<K, V> {
    shards: Vec<Mutex<LruCache<K, V>>>,
}

impl<K, V> ShardedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(shard_count: usize, capacity_per_shard: usize) -> Self {
        let cap = NonZeroUsize::new(capacity_per_shard.max(1)).unwrap();
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(LruCache::new(cap)))
            .collect();
        ShardedCache { shards }
    }

    fn shard_for(&self, key: &K) -> &Mutex<LruCache<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Returns a clone of the cached value, promoting it as most-recently
    /// used, or `None` on a miss.
    ///
    /// Takes `&self`: each shard carries its own mutex, so independent
    /// shards never contend and callers don't need an outer lock around
    /// the whole cache (component §4.6, concurrency model §5).
    pub fn get(&self, key: &K) -> Option<V> {
        let mut shard = self.shard_for(key).lock().unwrap();
        shard.get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        let mut shard = self.shard_for(&key).lock().unwrap();
        shard.put(key, value);
    }

    /// Drops any cached entry for `key`, forcing the next read to go back
    /// to the backend. Used when a cluster's on-disk bytes are replaced out
    /// from under an existing cache entry (COW, rewrite of a compressed
    /// cluster).
    pub fn invalidate(&self, key: &K) {
        let mut shard = self.shard_for(key).lock().unwrap();
        shard.pop(key);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
    }
}

/// Default shard count used by the image's L2, refcount-block, and
/// compressed-cluster caches.
pub const DEFAULT_SHARDS: usize = 16;
/// Default per-shard capacity (entries), chosen so a modest working set of
/// hot L2 tables or refcount blocks stays resident without bounding memory
/// use by image size.
pub const DEFAULT_SHARD_CAPACITY: usize = 64;

/// A pool of reusable cluster-sized scratch buffers, avoiding an allocation
/// on every zero-fill, COW copy, or decompression.
pub struct BufferPool {
    cluster_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(cluster_size: usize) -> Self {
        BufferPool {
            cluster_size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Borrows a zero-filled cluster-sized buffer from the pool.
    pub fn take(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut buf) => {
                buf.iter_mut().for_each(|b| *b = 0);
                buf
            }
            None => vec![0u8; self.cluster_size],
        }
    }

    /// Returns a buffer to the pool for reuse. Buffers of the wrong size
    /// (shouldn't happen, but cheap to guard) are simply dropped.
    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.len() != self.cluster_size {
            return;
        }
        self.free.lock().unwrap().push(buf);
    }
}
