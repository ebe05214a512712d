//! Bounded read caches
//!
//! Three caches (bloomfilter, index data, value log) keyed by
//! `(database, table, index, level, sstable)` hashed with xxHash64. Each
//! tracks byte usage: crossing the soft limit evicts least-recently-used
//! items down to it; an insert that would cross the hard limit evicts first.
//! Item cleanup is plain `Drop` on the cached variant.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::tosdb::bloomfilter::Bloomfilter;
use crate::tosdb::sstable::IndexItem;
use crate::utils::hash::xxhash64;

/// Cache key tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub database_id: u64,
    pub table_id: u64,
    pub index_id: u64,
    pub level: u64,
    pub sstable_id: u64,
}

impl CacheKey {
    /// 64-bit identity used by the hashed maps.
    pub fn hashed(&self) -> u64 {
        let mut bytes = [0u8; 40];
        bytes[0..8].copy_from_slice(&self.database_id.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.table_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index_id.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.level.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.sstable_id.to_le_bytes());
        xxhash64(&bytes)
    }
}

struct CacheSlot<T> {
    value: Arc<T>,
    size: usize,
    last_use: u64,
}

struct BoundedCache<T> {
    slots: BTreeMap<u64, CacheSlot<T>>,
    soft_limit: usize,
    hard_limit: usize,
    used: usize,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl<T> BoundedCache<T> {
    const fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            soft_limit,
            hard_limit,
            used: 0,
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: u64) -> Option<Arc<T>> {
        self.clock += 1;
        let clock = self.clock;
        match self.slots.get_mut(&key) {
            Some(slot) => {
                slot.last_use = clock;
                self.hits += 1;
                Some(slot.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: u64, value: Arc<T>, size: usize) {
        if size > self.hard_limit {
            // Would never fit; serve it uncached.
            return;
        }
        if let Some(old) = self.slots.remove(&key) {
            self.used -= old.size;
        }
        while self.used + size > self.hard_limit {
            if !self.evict_one() {
                break;
            }
        }
        self.clock += 1;
        self.used += size;
        self.slots.insert(
            key,
            CacheSlot {
                value,
                size,
                last_use: self.clock,
            },
        );
        // Soft limit: shrink back down before the next insert pays for it.
        while self.used > self.soft_limit {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Drop the least-recently-used slot; its contents free on Drop.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_use)
            .map(|(&k, _)| k);
        match victim {
            Some(k) => {
                if let Some(slot) = self.slots.remove(&k) {
                    self.used -= slot.size;
                }
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: u64) {
        if let Some(slot) = self.slots.remove(&key) {
            self.used -= slot.size;
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn used(&self) -> usize {
        self.used
    }
}

/// Cache configuration: hard byte limits per cache; soft limits are half.
#[derive(Debug, Clone, Copy)]
pub struct TosdbCacheConfig {
    pub bloomfilter_size: usize,
    pub index_data_size: usize,
    pub valuelog_size: usize,
}

impl Default for TosdbCacheConfig {
    fn default() -> Self {
        Self {
            bloomfilter_size: 4 << 20,
            index_data_size: 8 << 20,
            valuelog_size: 16 << 20,
        }
    }
}

/// Hit/miss counters surfaced for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub items: usize,
    pub used_bytes: usize,
}

/// The three read caches.
pub struct TosdbCache {
    bloomfilters: Mutex<BoundedCache<Bloomfilter>>,
    index_data: Mutex<BoundedCache<Vec<IndexItem>>>,
    valuelogs: Mutex<BoundedCache<Vec<u8>>>,
}

impl TosdbCache {
    pub fn new(config: TosdbCacheConfig) -> Self {
        Self {
            bloomfilters: Mutex::new(BoundedCache::new(
                config.bloomfilter_size / 2,
                config.bloomfilter_size,
            )),
            index_data: Mutex::new(BoundedCache::new(
                config.index_data_size / 2,
                config.index_data_size,
            )),
            valuelogs: Mutex::new(BoundedCache::new(
                config.valuelog_size / 2,
                config.valuelog_size,
            )),
        }
    }

    pub fn get_bloomfilter(&self, key: &CacheKey) -> Option<Arc<Bloomfilter>> {
        self.bloomfilters.lock().get(key.hashed())
    }

    pub fn put_bloomfilter(&self, key: &CacheKey, value: Arc<Bloomfilter>) {
        let size = value.byte_size();
        self.bloomfilters.lock().put(key.hashed(), value, size);
    }

    pub fn get_index(&self, key: &CacheKey) -> Option<Arc<Vec<IndexItem>>> {
        self.index_data.lock().get(key.hashed())
    }

    pub fn put_index(&self, key: &CacheKey, value: Arc<Vec<IndexItem>>) {
        let size = value.len() * core::mem::size_of::<IndexItem>();
        self.index_data.lock().put(key.hashed(), value, size);
    }

    pub fn get_valuelog(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        self.valuelogs.lock().get(key.hashed())
    }

    pub fn put_valuelog(&self, key: &CacheKey, value: Arc<Vec<u8>>) {
        let size = value.len();
        self.valuelogs.lock().put(key.hashed(), value, size);
    }

    /// Drop every entry belonging to one sstable (compaction retired it).
    pub fn invalidate(&self, key: &CacheKey) {
        let hashed = key.hashed();
        self.bloomfilters.lock().remove(hashed);
        self.index_data.lock().remove(hashed);
        self.valuelogs.lock().remove(hashed);
    }

    pub fn stats(&self) -> (CacheStats, CacheStats, CacheStats) {
        fn snapshot<T>(c: &Mutex<BoundedCache<T>>) -> CacheStats {
            let c = c.lock();
            CacheStats {
                hits: c.hits,
                misses: c.misses,
                items: c.len(),
                used_bytes: c.used(),
            }
        }
        (
            snapshot(&self.bloomfilters),
            snapshot(&self.index_data),
            snapshot(&self.valuelogs),
        )
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn key(sstable_id: u64) -> CacheKey {
        CacheKey {
            database_id: 1,
            table_id: 2,
            index_id: 3,
            level: 1,
            sstable_id,
        }
    }

    #[test]
    fn test_key_hash_distinguishes_fields() {
        let base = key(1).hashed();
        assert_ne!(base, key(2).hashed());
        let mut other = key(1);
        other.level = 2;
        assert_ne!(base, other.hashed());
        assert_eq!(base, key(1).hashed());
    }

    #[test]
    fn test_put_get_valuelog() {
        let cache = TosdbCache::new(TosdbCacheConfig::default());
        assert!(cache.get_valuelog(&key(1)).is_none());
        cache.put_valuelog(&key(1), Arc::new(alloc::vec![7u8; 128]));
        let got = cache.get_valuelog(&key(1)).unwrap();
        assert_eq!(got.len(), 128);
        let (_, _, vstats) = cache.stats();
        assert_eq!(vstats.hits, 1);
        assert_eq!(vstats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_on_limits() {
        let cache = TosdbCache::new(TosdbCacheConfig {
            bloomfilter_size: 1 << 20,
            index_data_size: 1 << 20,
            valuelog_size: 1024,
        });
        // Soft limit 512: three 300-byte items cannot all stay.
        cache.put_valuelog(&key(1), Arc::new(alloc::vec![1u8; 300]));
        cache.put_valuelog(&key(2), Arc::new(alloc::vec![2u8; 300]));
        // Touch 2 so 1 is the LRU victim.
        assert!(cache.get_valuelog(&key(2)).is_some());
        cache.put_valuelog(&key(3), Arc::new(alloc::vec![3u8; 300]));

        let (_, _, stats) = cache.stats();
        assert!(stats.used_bytes <= 512, "soft limit not enforced");
        assert!(cache.get_valuelog(&key(1)).is_none(), "lru item must go");
    }

    #[test]
    fn test_oversized_item_not_cached() {
        let cache = TosdbCache::new(TosdbCacheConfig {
            bloomfilter_size: 1 << 20,
            index_data_size: 1 << 20,
            valuelog_size: 256,
        });
        cache.put_valuelog(&key(9), Arc::new(alloc::vec![0u8; 4096]));
        assert!(cache.get_valuelog(&key(9)).is_none());
    }

    #[test]
    fn test_invalidate_clears_all_three() {
        let cache = TosdbCache::new(TosdbCacheConfig::default());
        cache.put_valuelog(&key(5), Arc::new(alloc::vec![0u8; 10]));
        cache.put_index(&key(5), Arc::new(alloc::vec![]));
        cache.invalidate(&key(5));
        assert!(cache.get_valuelog(&key(5)).is_none());
        assert!(cache.get_index(&key(5)).is_none());
    }
}
