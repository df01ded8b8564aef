//! Read cache for chunk payloads
//!
//! Purely an accelerator: the store invalidates entries synchronously on
//! delete, so a cache never changes what Get returns.

use crate::chunk::Address;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capabilities the store needs from a cache
pub trait ChunkCache: Send + Sync {
    fn get(&self, address: &Address) -> Option<Bytes>;
    fn put(&self, address: Address, data: Bytes);
    fn remove(&self, address: &Address);
    fn clear(&self);
    fn stats(&self) -> CacheStats;
}

/// Bounded LRU cache keyed by address
pub struct LruChunkCache {
    cache: Mutex<LruCache<Address, Bytes>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl LruChunkCache {
    /// Create a cache holding at most `capacity` chunks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }
}

impl ChunkCache for LruChunkCache {
    fn get(&self, address: &Address) -> Option<Bytes> {
        let hit = self.cache.lock().get(address).cloned();
        match hit {
            Some(_) => self.hit_count.fetch_add(1, Ordering::Relaxed),
            None => self.miss_count.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    fn put(&self, address: Address, data: Bytes) {
        self.cache.lock().put(address, data);
    }

    fn remove(&self, address: &Address) {
        self.cache.lock().pop(address);
    }

    fn clear(&self) {
        self.cache.lock().clear();
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let cache = self.cache.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: cache.len(),
            capacity: cache.cap().get(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}
