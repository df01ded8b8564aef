//! Chunk store façade
//!
//! Coordinates the shard selector, the shards, the metadata index and the
//! optional cache behind the public Put/Get/Delete/Iterate contract.
//!
//! # Locking
//!
//! - Each shard serializes its own slot I/O; different shards run in parallel.
//! - Put, Delete, the cache-miss path of Get and each Iterate step hold a
//!   per-address lock, so no caller sees a half-applied mutation of the
//!   same address and a slot is never reused under a reader.
//! - Close and Check take the store-wide write lock; every other operation
//!   holds it shared for its duration.

use super::cache::{CacheStats, ChunkCache, LruChunkCache};
use super::metadata::{LogMetaStore, MetaStore};
use super::selector::select_shard;
use super::shard::{snapshot_stats, Shard};
use super::slot::{MetaEntry, ShardId, SlotId};
use crate::chunk::{Address, Chunk};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cell::RefCell;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Capacity snapshot of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    pub shard: ShardId,
    /// File size in bytes
    pub capacity: u64,
    pub free_slots: u64,
}

/// Result of a consistency scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Metadata entries
    pub entries: usize,
    /// Slots referenced by an entry
    pub occupied: u64,
    /// Slots on a free list
    pub free: u64,
    /// Slots neither free nor referenced (left by a failed metadata write)
    pub leaked: u64,
    pub shards: Vec<ShardReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardReport {
    pub shard: ShardId,
    pub total_slots: u64,
    pub occupied: u64,
    pub free: u64,
    pub leaked: u64,
}

/// Content-addressed chunk store over a fixed set of shard files
pub struct Store {
    config: StoreConfig,
    inner: RwLock<Option<Inner>>,
    locks: AddressLocks,
}

struct Inner {
    shards: Vec<Shard>,
    meta: Box<dyn MetaStore>,
    cache: Option<Box<dyn ChunkCache>>,
}

impl Store {
    /// Open a store with the durable log index under `<storage_path>/meta`
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let meta = LogMetaStore::open(config.meta_path(), config.sync_writes)?;
        Self::with_meta(config, Box::new(meta))
    }

    /// Open a store over an injected metadata index; cache per config
    pub fn with_meta(config: StoreConfig, meta: Box<dyn MetaStore>) -> Result<Self> {
        let cache = config.cache_enabled.then(|| {
            Box::new(LruChunkCache::new(config.cache_capacity)) as Box<dyn ChunkCache>
        });
        Self::with_components(config, meta, cache)
    }

    /// Open a store over injected collaborators
    ///
    /// Scans the index once to rebuild every shard's free list before the
    /// store accepts operations.
    pub fn with_components(
        config: StoreConfig,
        meta: Box<dyn MetaStore>,
        cache: Option<Box<dyn ChunkCache>>,
    ) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();
        std::fs::create_dir_all(&config.storage_path)?;

        info!(
            path = ?config.storage_path,
            shards = config.shard_count,
            max_chunk_size = config.max_chunk_size,
            cache = cache.is_some(),
            "Opening chunk store"
        );

        let shard_count = config.shard_count as usize;
        let mut occupied: Vec<Vec<u64>> = vec![Vec::new(); shard_count];
        meta.iterate(&mut |address, entry| {
            if entry.shard() as usize >= shard_count {
                return Err(Error::Inconsistent(format!(
                    "chunk {} is stored on shard {} but the store has {} shards",
                    address,
                    entry.shard(),
                    shard_count
                )));
            }
            if entry.len as usize > config.max_chunk_size {
                return Err(Error::Inconsistent(format!(
                    "chunk {} has length {} above the slot size {}",
                    address, entry.len, config.max_chunk_size
                )));
            }
            occupied[entry.shard() as usize].push(entry.slot.index);
            Ok(ControlFlow::Continue(()))
        })?;

        let shards = occupied
            .into_iter()
            .enumerate()
            .map(|(id, slots)| {
                Shard::open(
                    &config.storage_path,
                    id as ShardId,
                    config.max_chunk_size,
                    config.sync_writes,
                    slots,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(chunks = meta.count()?, "Chunk store ready");

        Ok(Self {
            config,
            inner: RwLock::new(Some(Inner {
                shards,
                meta,
                cache,
            })),
            locks: AddressLocks::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Store a chunk and return the shard that holds it
    ///
    /// Putting an address that is already live is a no-op returning the
    /// shard of the existing copy.
    pub fn put(&self, chunk: &Chunk) -> Result<ShardId> {
        let result = self.with_inner(|inner| self.put_inner(inner, chunk));
        metrics::record_op("put", &result);
        result
    }

    fn put_inner(&self, inner: &Inner, chunk: &Chunk) -> Result<ShardId> {
        let data = chunk.data();
        if data.len() > self.config.max_chunk_size {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: self.config.max_chunk_size,
            });
        }

        let address = chunk.address();
        let lock = self.locks.lock_for(address);
        let _held = lock.lock();

        if let Some(existing) = inner.meta.get(address)? {
            debug!(%address, shard = existing.shard(), "Chunk already stored");
            return Ok(existing.shard());
        }

        let shard_id = inner.next_shard()?;
        let index = inner.shards[shard_id as usize].reserve_and_write(data)?;
        let entry = MetaEntry::new(SlotId::new(shard_id, index), data.len() as u32);

        if let Err(e) = inner.meta.put(address, entry) {
            error!(
                %address,
                slot = %entry.slot,
                "Metadata write failed after slot write, slot leaked: {}",
                e
            );
            return Err(e);
        }

        if let Some(cache) = &inner.cache {
            cache.put(*address, data.clone());
        }

        debug!(%address, shard = shard_id, slot = index, len = data.len(), "Put chunk");
        Ok(shard_id)
    }

    /// Fetch a chunk by address
    pub fn get(&self, address: &Address) -> Result<Chunk> {
        let result = self.with_inner(|inner| {
            if let Some(cache) = &inner.cache {
                let cached = cache.get(address);
                metrics::record_cache(cached.is_some());
                if let Some(data) = cached {
                    return Ok(Chunk::with_address(*address, data));
                }
            }

            let lock = self.locks.lock_for(address);
            let _held = lock.lock();

            let chunk = inner.read_chunk(address)?;
            if let Some(cache) = &inner.cache {
                cache.put(*address, chunk.data().clone());
            }
            Ok(chunk)
        });
        metrics::record_op("get", &result);
        result
    }

    /// Remove a chunk and free its slot; `ChunkNotFound` if absent
    pub fn delete(&self, address: &Address) -> Result<()> {
        let result = self.with_inner(|inner| {
            let lock = self.locks.lock_for(address);
            let _held = lock.lock();

            let entry = inner
                .meta
                .get(address)?
                .ok_or(Error::ChunkNotFound(*address))?;

            if let Some(cache) = &inner.cache {
                cache.remove(address);
            }
            inner.meta.delete(address)?;
            inner.shard(entry.shard())?.release(entry.slot.index)?;

            debug!(%address, slot = %entry.slot, "Deleted chunk");
            Ok(())
        });
        metrics::record_op("delete", &result);
        result
    }

    /// Whether a chunk is stored, without reading its payload
    pub fn has(&self, address: &Address) -> Result<bool> {
        self.with_inner(|inner| {
            if let Some(cache) = &inner.cache {
                if cache.get(address).is_some() {
                    return Ok(true);
                }
            }
            Ok(inner.meta.get(address)?.is_some())
        })
    }

    /// Number of live chunks
    pub fn count(&self) -> Result<usize> {
        self.with_inner(|inner| inner.meta.count())
    }

    /// Visit every live chunk in metadata index order
    ///
    /// Chunks deleted while the iteration runs are skipped. The visitor may
    /// call back into the store; [`check`](Self::check) and
    /// [`close`](Self::close) fail with `Reentrant` there.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Chunk) -> Result<ControlFlow<()>>,
    {
        let _visiting = VisitGuard::enter(self);
        self.with_inner(|inner| {
            inner.meta.iterate(&mut |address, _| {
                let chunk = {
                    let lock = self.locks.lock_for(address);
                    let _held = lock.lock();
                    match inner.read_chunk(address) {
                        Ok(chunk) => chunk,
                        Err(Error::ChunkNotFound(_)) => return Ok(ControlFlow::Continue(())),
                        Err(e) => return Err(e),
                    }
                };
                visit(chunk)
            })
        })
    }

    /// Capacity of every shard, in shard order
    pub fn shard_size(&self) -> Result<Vec<ShardInfo>> {
        self.with_inner(|inner| {
            Ok(snapshot_stats(&inner.shards)
                .into_iter()
                .map(|stat| ShardInfo {
                    shard: stat.shard,
                    capacity: stat.capacity,
                    free_slots: stat.free_slots,
                })
                .collect())
        })
    }

    /// The shard the next Put would go to
    pub fn next_shard(&self) -> Result<ShardId> {
        self.with_inner(|inner| inner.next_shard())
    }

    /// Fsync every shard file
    pub fn flush(&self) -> Result<()> {
        self.with_inner(|inner| inner.shards.iter().try_for_each(|shard| shard.flush()))
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        let guard = self.inner.read_recursive();
        guard.as_ref()?.cache.as_ref().map(|cache| cache.stats())
    }

    /// Verify the occupancy invariants between index and shards
    ///
    /// Blocks all other operations while it runs. Fails with
    /// `Inconsistent` when an entry points outside its shard, two entries
    /// share a slot, or a referenced slot is on a free list. Leaked slots
    /// are only reported.
    pub fn check(&self) -> Result<ConsistencyReport> {
        if VisitGuard::is_visiting(self) {
            return Err(Error::Reentrant("check"));
        }
        let guard = self.inner.write();
        let inner = guard.as_ref().ok_or(Error::Closed)?;

        let snapshots: Vec<_> = inner.shards.iter().map(|s| s.slot_snapshot()).collect();
        let mut states: Vec<Vec<SlotState>> = snapshots
            .iter()
            .map(|snap| {
                let mut states = vec![SlotState::Unreferenced; snap.total_slots as usize];
                for &index in &snap.free_slots {
                    states[index as usize] = SlotState::Free;
                }
                states
            })
            .collect();

        let mut entries = 0usize;
        inner.meta.iterate(&mut |address, entry| {
            entries += 1;
            let shard = states.get_mut(entry.shard() as usize).ok_or_else(|| {
                Error::Inconsistent(format!(
                    "chunk {} references missing shard {}",
                    address,
                    entry.shard()
                ))
            })?;
            let state = shard.get_mut(entry.slot.index as usize).ok_or_else(|| {
                Error::Inconsistent(format!(
                    "chunk {} references {} beyond shard capacity",
                    address, entry.slot
                ))
            })?;
            match state {
                SlotState::Unreferenced => *state = SlotState::Referenced,
                SlotState::Referenced => {
                    return Err(Error::Inconsistent(format!(
                        "{} is referenced by more than one chunk",
                        entry.slot
                    )))
                }
                SlotState::Free => {
                    return Err(Error::Inconsistent(format!(
                        "chunk {} references free {}",
                        address, entry.slot
                    )))
                }
            }
            Ok(ControlFlow::Continue(()))
        })?;

        let mut report = ConsistencyReport {
            entries,
            ..Default::default()
        };
        for (id, (snap, states)) in snapshots.iter().zip(&states).enumerate() {
            let occupied = states
                .iter()
                .filter(|s| **s == SlotState::Referenced)
                .count() as u64;
            let free = snap.free_slots.len() as u64;
            let shard = ShardReport {
                shard: id as ShardId,
                total_slots: snap.total_slots,
                occupied,
                free,
                leaked: snap.total_slots - occupied - free,
            };
            report.occupied += shard.occupied;
            report.free += shard.free;
            report.leaked += shard.leaked;
            report.shards.push(shard);
        }

        info!(
            entries = report.entries,
            occupied = report.occupied,
            free = report.free,
            leaked = report.leaked,
            "Consistency check complete"
        );
        Ok(report)
    }

    /// Flush and release all shard files and the metadata index
    ///
    /// Every later operation, including another close, fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        if VisitGuard::is_visiting(self) {
            return Err(Error::Reentrant("close"));
        }
        let inner = self.inner.write().take().ok_or(Error::Closed)?;

        let mut first_err = None;
        for shard in &inner.shards {
            if let Err(e) = shard.flush() {
                error!(shard = shard.id(), "Failed to flush shard on close: {}", e);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = inner.meta.close() {
            error!("Failed to close metadata index: {}", e);
            first_err.get_or_insert(e);
        }
        if let Some(cache) = &inner.cache {
            cache.clear();
        }
        drop(inner);

        info!(path = ?self.config.storage_path, "Closed chunk store");
        first_err.map_or(Ok(()), Err)
    }

    fn with_inner<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        // Recursive so visitors can re-enter while close() is waiting
        let guard = self.inner.read_recursive();
        let inner = guard.as_ref().ok_or(Error::Closed)?;
        f(inner)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("open", &self.inner.read_recursive().is_some())
            .finish()
    }
}

impl Inner {
    fn shard(&self, id: ShardId) -> Result<&Shard> {
        self.shards.get(id as usize).ok_or_else(|| {
            Error::Inconsistent(format!(
                "shard {} does not exist ({} shards)",
                id,
                self.shards.len()
            ))
        })
    }

    fn next_shard(&self) -> Result<ShardId> {
        select_shard(&snapshot_stats(&self.shards))
            .ok_or_else(|| Error::Inconsistent("store has no shards".to_string()))
    }

    /// Read a chunk through the index; caller holds the address lock
    fn read_chunk(&self, address: &Address) -> Result<Chunk> {
        let entry = self
            .meta
            .get(address)?
            .ok_or(Error::ChunkNotFound(*address))?;
        let data = self
            .shard(entry.shard())?
            .read(entry.slot.index, entry.len as usize)?;
        Ok(Chunk::with_address(*address, data))
    }
}

thread_local! {
    /// Stores whose iterate visitor is running on this thread
    static VISITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a store as iterating on the current thread until dropped
///
/// `check` and `close` need the store-wide write lock, which the iterating
/// thread already holds shared.
struct VisitGuard(usize);

impl VisitGuard {
    fn enter(store: &Store) -> Self {
        let id = store as *const Store as usize;
        VISITING.with(|v| v.borrow_mut().push(id));
        Self(id)
    }

    fn is_visiting(store: &Store) -> bool {
        let id = store as *const Store as usize;
        VISITING.with(|v| v.borrow().contains(&id))
    }
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        VISITING.with(|v| {
            let mut v = v.borrow_mut();
            if let Some(pos) = v.iter().rposition(|&id| id == self.0) {
                v.remove(pos);
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unreferenced,
    Referenced,
    Free,
}

/// Threshold above which dead lock entries are swept
const ADDRESS_LOCK_SWEEP: usize = 4096;

/// Per-address mutexes, dropped once no operation holds them
#[derive(Default)]
struct AddressLocks {
    locks: DashMap<Address, Weak<Mutex<()>>>,
}

impl AddressLocks {
    fn lock_for(&self, address: &Address) -> Arc<Mutex<()>> {
        let lock = match self.locks.entry(*address) {
            Entry::Occupied(mut e) => match e.get().upgrade() {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    e.insert(Arc::downgrade(&lock));
                    lock
                }
            },
            Entry::Vacant(e) => {
                let lock = Arc::new(Mutex::new(()));
                e.insert(Arc::downgrade(&lock));
                lock
            }
        };

        if self.locks.len() > ADDRESS_LOCK_SWEEP {
            self.locks.retain(|_, lock| lock.strong_count() > 0);
        }
        lock
    }
}
