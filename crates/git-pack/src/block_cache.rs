//! Block cache for pack-family files: caches fixed-size byte windows (and
//! small parsed items, such as an already-opened index) keyed by pack
//! identity, extension, and aligned offset.
//!
//! Sharded into `concurrency_level` independently-locked buckets, each doing
//! clock (second-chance) eviction against its own share of the byte budget.
//! A key's `PackExt` may be routed to a dedicated partition with its own
//! budget, falling back to a default partition for anything unmapped.
//!
//! Concurrent misses on the same key single-flight: the first caller loads,
//! later callers block on the in-flight load rather than repeating it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Kind of pack-sibling file a cached block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackExt {
    Pack,
    Index,
    ReverseIndex,
    BitmapIndex,
    CommitGraph,
    Keep,
    ObjectSizeIndex,
}

/// Identity of a pack (or pack-family file group), stable across opens of
/// the same underlying file. A repack produces a new identity, which keeps
/// the cache from ever aliasing stale bytes onto a reused filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackIdentity(pub String);

impl PackIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// `(pack identity, extension)` — identifies one logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub pack: PackIdentity,
    pub ext: PackExt,
}

/// `(stream, block-aligned offset)` — the cache's lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockCacheKey {
    pub stream: StreamKey,
    pub block_offset: u64,
}

/// A cached value: either an owned byte window or an arbitrary parsed item
/// (e.g. a loaded `PackIndex`) shared via reference counting.
#[derive(Clone)]
pub enum CacheValue {
    Block(Arc<[u8]>),
    Ref(Arc<dyn std::any::Any + Send + Sync>),
}

/// Per-extension observable counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtStats {
    pub current_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub evictions: u64,
}

impl ExtStats {
    pub fn total_requests(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    /// Hit ratio rounded to the nearest percentage point, 0 when there have
    /// been no requests yet.
    pub fn hit_ratio(&self) -> u32 {
        let total = self.total_requests();
        if total == 0 {
            return 0;
        }
        ((self.hit_count * 100 + total / 2) / total) as u32
    }
}

struct Slot {
    key: BlockCacheKey,
    value: CacheValue,
    size: usize,
    ref_bit: bool,
}

struct PendingLoad {
    done: Mutex<Option<Result<(CacheValue, usize), String>>>,
    cv: Condvar,
}

#[derive(Default)]
struct Shard {
    index: HashMap<BlockCacheKey, usize>,
    slots: Vec<Option<Slot>>,
    clock_hand: usize,
    current_size: usize,
    pending: HashMap<BlockCacheKey, Arc<PendingLoad>>,
}

impl Shard {
    fn touch(&mut self, key: &BlockCacheKey) -> Option<CacheValue> {
        let &slot_ix = self.index.get(key)?;
        let slot = self.slots[slot_ix].as_mut().expect("indexed slot present");
        slot.ref_bit = true;
        Some(slot.value.clone())
    }

    fn insert(&mut self, key: BlockCacheKey, value: CacheValue, size: usize, budget: usize) -> u64 {
        let mut evictions = 0u64;
        while self.current_size + size > budget && !self.slots.is_empty() {
            if !self.evict_one() {
                break;
            }
            evictions += 1;
        }

        let slot = Slot {
            key: key.clone(),
            value,
            size,
            ref_bit: false,
        };

        // Reuse a hole left by eviction if one exists, else append.
        if let Some(hole) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[hole] = Some(slot);
            self.index.insert(key, hole);
        } else {
            self.index.insert(key, self.slots.len());
            self.slots.push(Some(slot));
        }
        self.current_size += size;
        evictions
    }

    /// Sweep the clock hand, clearing reference bits until an unset one is
    /// found; evict that entry. Returns false if the shard is empty.
    fn evict_one(&mut self) -> bool {
        let n = self.slots.len();
        if n == 0 {
            return false;
        }
        for _ in 0..2 * n {
            let ix = self.clock_hand % n;
            self.clock_hand = (self.clock_hand + 1) % n;
            let Some(slot) = self.slots[ix].as_mut() else {
                continue;
            };
            if slot.ref_bit {
                slot.ref_bit = false;
                continue;
            }
            let removed = self.slots[ix].take().unwrap();
            self.index.remove(&removed.key);
            self.current_size -= removed.size;
            return true;
        }
        false
    }
}

struct Partition {
    shards: Vec<Mutex<Shard>>,
    budget_per_shard: usize,
    stats: Mutex<HashMap<PackExt, ExtStats>>,
}

impl Partition {
    fn new(concurrency_level: usize, block_limit: usize) -> Self {
        let shards = (0..concurrency_level.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            shards,
            budget_per_shard: (block_limit / concurrency_level.max(1)).max(1),
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn shard_for(&self, key: &BlockCacheKey) -> &Mutex<Shard> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let ix = (hasher.finish() as usize) % self.shards.len();
        &self.shards[ix]
    }

    fn record_hit(&self, ext: PackExt) {
        self.stats.lock().unwrap().entry(ext).or_default().hit_count += 1;
    }

    fn record_miss_and_evictions(&self, ext: PackExt, evictions: u64, size_delta: i64) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(ext).or_default();
        entry.miss_count += 1;
        entry.evictions += evictions;
        if size_delta >= 0 {
            entry.current_size += size_delta as u64;
        } else {
            entry.current_size = entry.current_size.saturating_sub((-size_delta) as u64);
        }
    }
}

/// Default concurrency level (number of shards) when unconfigured.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 32;

/// Default block size: 64 KiB windows.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// The block cache. Create one per process (or per `ObjectDirectory`); share
/// it across all open packs so repacks can't resurrect stale bytes under an
/// old key (`StreamKey` embeds pack identity).
pub struct BlockCache {
    block_size: u64,
    default_partition: Partition,
    /// Extensions routed to a dedicated partition instead of the default.
    /// Shared via `Arc` since several extensions may be bound to the same
    /// named partition (one budget table, several streams).
    partitions: HashMap<PackExt, Arc<Partition>>,
}

/// Declares a dedicated partition for a set of `PackExt`s with its own byte
/// budget, independent of the default partition.
pub struct PartitionConfig {
    pub exts: Vec<PackExt>,
    pub block_limit: usize,
    pub concurrency_level: usize,
}

impl BlockCache {
    /// Build a cache with a single default partition.
    pub fn new(block_limit: usize, concurrency_level: usize) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE as u64,
            default_partition: Partition::new(concurrency_level, block_limit),
            partitions: HashMap::new(),
        }
    }

    /// Build a cache with a default partition plus dedicated partitions for
    /// specific extensions. Panics if an extension appears in more than one
    /// partition config — that's a configuration bug, not a runtime state.
    pub fn with_partitions(
        default_block_limit: usize,
        default_concurrency_level: usize,
        configs: Vec<PartitionConfig>,
    ) -> Self {
        let mut partitions = HashMap::new();
        for cfg in configs {
            let table = Arc::new(Partition::new(cfg.concurrency_level, cfg.block_limit));
            for ext in cfg.exts {
                if partitions.contains_key(&ext) {
                    panic!("PackExt {ext:?} bound to more than one block-cache partition");
                }
                partitions.insert(ext, table.clone());
            }
        }
        Self {
            block_size: DEFAULT_BLOCK_SIZE as u64,
            default_partition: Partition::new(default_concurrency_level, default_block_limit),
            partitions,
        }
    }

    /// Block size used to align offsets into this cache's keys.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn partition_for(&self, ext: PackExt) -> &Partition {
        self.partitions
            .get(&ext)
            .map(|p| p.as_ref())
            .unwrap_or(&self.default_partition)
    }

    /// Look up `key` without triggering a load. Records a hit/miss for
    /// stats either way.
    pub fn get(&self, key: &BlockCacheKey) -> Option<CacheValue> {
        let ext = key.stream.ext;
        let partition = self.partition_for(ext);
        let mut shard = partition.shard_for(key).lock().unwrap();
        let hit = shard.touch(key);
        drop(shard);
        if hit.is_some() {
            partition.record_hit(ext);
        }
        hit
    }

    /// Insert an already-computed value for `key`, for callers whose value
    /// wasn't produced inside a single `get_or_load` closure (e.g. a
    /// cross-pack delta resolution that fans out into another pack).
    /// Counts as a miss for stats purposes, since the caller only reaches
    /// here after failing a [`get`](Self::get).
    pub fn insert(&self, key: BlockCacheKey, value: CacheValue, size: usize) {
        let ext = key.stream.ext;
        let partition = self.partition_for(ext);
        let mut shard = partition.shard_for(&key).lock().unwrap();
        let evictions = shard.insert(key, value, size, partition.budget_per_shard);
        drop(shard);
        partition.record_miss_and_evictions(ext, evictions, size as i64);
    }

    /// Fetch or load the cached value for `key`. On miss, `loader` runs with
    /// no locks held; concurrent misses on the same key share one load.
    pub fn get_or_load<E, F>(&self, key: BlockCacheKey, loader: F) -> Result<CacheValue, E>
    where
        F: FnOnce() -> Result<(CacheValue, usize), E>,
        E: std::fmt::Display + From<String>,
    {
        let ext = key.stream.ext;
        let partition = self.partition_for(ext);
        let shard_mutex = partition.shard_for(&key);

        // Fast path: cache hit.
        {
            let mut shard = shard_mutex.lock().unwrap();
            if let Some(v) = shard.touch(&key) {
                partition.record_hit(ext);
                return Ok(v);
            }
            if let Some(pending) = shard.pending.get(&key).cloned() {
                drop(shard);
                return Self::await_pending(&pending).map_err(E::from);
            }
            // Claim the load.
            shard.pending.insert(
                key.clone(),
                Arc::new(PendingLoad {
                    done: Mutex::new(None),
                    cv: Condvar::new(),
                }),
            );
        }

        let result = loader();

        let mut shard = shard_mutex.lock().unwrap();
        let pending = shard.pending.remove(&key).expect("claimed pending load present");

        match result {
            Ok((value, size)) => {
                let evictions = shard.insert(key, value.clone(), size, partition.budget_per_shard);
                drop(shard);
                partition.record_miss_and_evictions(ext, evictions, size as i64);
                *pending.done.lock().unwrap() = Some(Ok((value.clone(), size)));
                pending.cv.notify_all();
                Ok(value)
            }
            Err(e) => {
                drop(shard);
                let msg = e.to_string();
                *pending.done.lock().unwrap() = Some(Err(msg.clone()));
                pending.cv.notify_all();
                Err(e)
            }
        }
    }

    fn await_pending(pending: &PendingLoad) -> Result<CacheValue, String> {
        let mut guard = pending.done.lock().unwrap();
        while guard.is_none() {
            guard = pending.cv.wait(guard).unwrap();
        }
        match guard.clone().unwrap() {
            Ok((value, _)) => Ok(value),
            Err(msg) => Err(msg),
        }
    }

    /// Snapshot of per-extension statistics across all partitions.
    pub fn stats(&self) -> HashMap<PackExt, ExtStats> {
        let mut out = self.default_partition.stats.lock().unwrap().clone();
        for table in self.partitions.values() {
            for (ext, stats) in table.stats.lock().unwrap().iter() {
                out.insert(*ext, *stats);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(pack: &str, ext: PackExt, offset: u64) -> BlockCacheKey {
        BlockCacheKey {
            stream: StreamKey {
                pack: PackIdentity::new(pack),
                ext,
            },
            block_offset: offset,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = BlockCache::new(1024 * 1024, 4);
        let k = key("p1", PackExt::Pack, 0);

        let calls = AtomicU32::new(0);
        let load = || -> Result<(CacheValue, usize), String> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok((CacheValue::Block(Arc::from(vec![1u8, 2, 3])), 3))
        };

        cache.get_or_load(k.clone(), load).unwrap();
        cache.get_or_load(k.clone(), load).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        let s = stats.get(&PackExt::Pack).unwrap();
        assert_eq!(s.hit_count, 1);
        assert_eq!(s.miss_count, 1);
    }

    #[test]
    fn distinct_pack_identity_is_a_distinct_key() {
        let cache = BlockCache::new(1024 * 1024, 4);
        let k1 = key("p1", PackExt::Pack, 0);
        let k2 = key("p2", PackExt::Pack, 0);

        cache
            .get_or_load(k1, || Ok::<_, String>((CacheValue::Block(Arc::from(vec![1u8])), 1)))
            .unwrap();
        cache
            .get_or_load(k2, || Ok::<_, String>((CacheValue::Block(Arc::from(vec![2u8])), 1)))
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.get(&PackExt::Pack).unwrap().miss_count, 2);
    }

    #[test]
    fn eviction_respects_budget() {
        // Single shard, tiny budget: inserting a third block must evict one.
        let cache = BlockCache::new(2, 1);
        for i in 0..3u64 {
            let k = key("p1", PackExt::Pack, i);
            cache
                .get_or_load(k, || Ok::<_, String>((CacheValue::Block(Arc::from(vec![0u8])), 1)))
                .unwrap();
        }
        let stats = cache.stats();
        let s = stats.get(&PackExt::Pack).unwrap();
        assert!(s.evictions >= 1);
    }

    #[test]
    fn partitioned_ext_uses_its_own_table() {
        let cache = BlockCache::with_partitions(
            1024,
            2,
            vec![PartitionConfig {
                exts: vec![PackExt::CommitGraph],
                block_limit: 1024,
                concurrency_level: 1,
            }],
        );

        cache
            .get_or_load(key("p1", PackExt::CommitGraph, 0), || {
                Ok::<_, String>((CacheValue::Block(Arc::from(vec![1u8])), 1))
            })
            .unwrap();
        cache
            .get_or_load(key("p1", PackExt::Pack, 0), || {
                Ok::<_, String>((CacheValue::Block(Arc::from(vec![2u8])), 1))
            })
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.get(&PackExt::CommitGraph).unwrap().miss_count, 1);
        assert_eq!(stats.get(&PackExt::Pack).unwrap().miss_count, 1);
    }
}
