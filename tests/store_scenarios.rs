//! End-to-end store scenarios over real shard files

use chunkstore::{
    Address, Chunk, Error, MemoryMetaStore, Result, ShardId, Store, StoreConfig, WorkerPool,
};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use tempfile::TempDir;

const CHUNK_SIZE: usize = 4096;
const SHARD_COUNT: u8 = 4;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path())
        .with_shard_count(SHARD_COUNT)
        .with_max_chunk_size(CHUNK_SIZE)
        .with_sync_writes(false)
}

fn random_chunk(len: usize) -> Chunk {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Chunk::new(data)
}

fn total_capacity(store: &Store) -> Result<u64> {
    Ok(store.shard_size()?.iter().map(|s| s.capacity).sum())
}

#[test]
fn test_reclaim_before_growth() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;

    let mut by_shard: HashMap<ShardId, Vec<Chunk>> = HashMap::new();
    for _ in 0..1000 {
        let chunk = random_chunk(CHUNK_SIZE);
        let shard = store.put(&chunk)?;
        by_shard.entry(shard).or_default().push(chunk);
    }
    assert_eq!(total_capacity(&store)?, 1000 * CHUNK_SIZE as u64);

    // Uneven holes: 4, 3, 2 and 1 free slots on shards 0..3
    for (shard, n) in [(0u8, 4usize), (1, 3), (2, 2), (3, 1)] {
        for chunk in &by_shard[&shard][..n] {
            store.delete(chunk.address())?;
        }
    }
    assert_eq!(store.count()?, 990);

    let mut placed = Vec::new();
    for _ in 0..10 {
        placed.push(store.put(&random_chunk(CHUNK_SIZE))?);
    }
    assert_eq!(placed, vec![0, 0, 1, 0, 1, 2, 0, 1, 2, 3]);

    // Every hole was reused, nothing grew
    assert_eq!(total_capacity(&store)?, 1000 * CHUNK_SIZE as u64);
    assert!(store.shard_size()?.iter().all(|s| s.free_slots == 0));
    Ok(())
}

#[test]
fn test_growth_picks_smallest_shard() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::with_meta(test_config(&dir), Box::new(MemoryMetaStore::new()))?;

    // 37 chunks leave shard 0 one slot ahead of the rest
    for _ in 0..37 {
        store.put(&random_chunk(128))?;
    }

    for _ in 0..1000 {
        let sizes = store.shard_size()?;
        assert!(sizes.iter().all(|s| s.free_slots == 0));

        let smallest = sizes
            .iter()
            .min_by_key(|s| (s.capacity, s.shard))
            .map(|s| s.shard);
        assert_eq!(Some(store.next_shard()?), smallest);

        let shard = store.put(&random_chunk(128))?;
        assert_eq!(Some(shard), smallest);

        let after = store.shard_size()?;
        for (before, after) in sizes.iter().zip(&after) {
            assert!(after.capacity >= before.capacity);
        }
    }
    Ok(())
}

#[test]
fn test_concurrent_put_get_delete() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;
    let pool = WorkerPool::new(8)?;

    let chunks: Vec<Chunk> = (0..500).map(|_| random_chunk(1024)).collect();
    pool.try_run(chunks.iter().collect(), |c| store.put(c))?;
    assert_eq!(store.count()?, 500);

    // Readers and deleters race on disjoint halves
    let work: Vec<(usize, &Chunk)> = chunks.iter().enumerate().collect();
    pool.try_run(work, |(i, c)| {
        if i % 2 == 0 {
            store.delete(c.address())
        } else {
            let got = store.get(c.address())?;
            assert_eq!(got.data(), c.data());
            Ok(())
        }
    })?;

    assert_eq!(store.count()?, 250);
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(store.has(c.address())?, i % 2 == 1);
    }

    let report = store.check()?;
    assert_eq!(report.entries, 250);
    assert_eq!(report.occupied, 250);
    assert_eq!(report.free, 250);
    assert_eq!(report.leaked, 0);
    Ok(())
}

enum Step {
    /// Put, then delete right away when the flag is set
    Put(Chunk, bool),
    Delete(Chunk),
}

#[test]
fn test_concurrent_put_delete_reuses_slots() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;
    let pool = WorkerPool::new(8)?;

    let mut live: Vec<Chunk> = Vec::new();
    let mut puts = 0;
    for _round in 0..5 {
        // Evict every 4th survivor of earlier rounds while new chunks land
        let mut evictions = Vec::new();
        let mut next_live = Vec::new();
        for (i, chunk) in live.into_iter().enumerate() {
            if i % 4 == 0 {
                evictions.push(Step::Delete(chunk));
            } else {
                next_live.push(chunk);
            }
        }

        let mut steps = Vec::new();
        for i in 0..200 {
            let chunk = random_chunk(512);
            let delete = i % 3 == 0;
            if !delete {
                next_live.push(chunk.clone());
            }
            steps.push(Step::Put(chunk, delete));
            if let Some(evict) = evictions.pop() {
                steps.push(evict);
            }
            puts += 1;
        }
        steps.extend(evictions);

        pool.try_run(steps, |step| match step {
            Step::Put(chunk, delete) => {
                store.put(&chunk)?;
                if delete {
                    store.delete(chunk.address())?;
                }
                Ok(())
            }
            Step::Delete(chunk) => store.delete(chunk.address()),
        })?;
        live = next_live;

        let report = store.check()?;
        assert_eq!(report.entries, live.len());
        assert_eq!(report.occupied, live.len() as u64);
        assert_eq!(report.leaked, 0);
    }

    assert_eq!(store.count()?, live.len());
    for chunk in &live {
        assert_eq!(&store.get(chunk.address())?, chunk);
    }

    // Slots never exceed one per put, and freed slots stay accounted for
    let report = store.check()?;
    let total_slots: u64 = report.shards.iter().map(|s| s.total_slots).sum();
    assert!(total_slots <= puts);
    assert_eq!(total_slots, report.occupied + report.free);
    Ok(())
}

#[test]
fn test_concurrent_same_address() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;
    let pool = WorkerPool::new(8)?;

    let chunk = random_chunk(512);
    let shards = pool.try_run(vec![&chunk; 64], |c| store.put(c))?;

    // One slot, one shard, however many writers raced
    assert!(shards.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.count()?, 1);
    assert_eq!(total_capacity(&store)?, CHUNK_SIZE as u64);

    let deletes = pool.run(vec![&chunk; 16], |c| store.delete(c.address()));
    assert_eq!(deletes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(deletes
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(Error::is_not_found));
    assert_eq!(store.check()?.leaked, 0);
    Ok(())
}

#[test]
fn test_iterate_visits_every_chunk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;

    let mut expected = HashSet::new();
    for _ in 0..200 {
        let chunk = random_chunk(300);
        store.put(&chunk)?;
        expected.insert(*chunk.address());
    }

    let mut seen = HashSet::new();
    store.iterate(|chunk| {
        assert_eq!(Address::of(chunk.data()), *chunk.address());
        assert!(seen.insert(*chunk.address()), "visited twice");
        Ok(ControlFlow::Continue(()))
    })?;

    assert_eq!(seen, expected);
    assert_eq!(seen.len(), store.count()?);
    Ok(())
}

#[test]
fn test_reopen_restores_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(&dir);

    let (kept, removed, sizes) = {
        let store = Store::open(config.clone())?;
        let chunks: Vec<Chunk> = (0..20).map(|_| random_chunk(2000)).collect();
        for c in &chunks {
            store.put(c)?;
        }
        let (removed, kept) = chunks.split_at(5);
        for c in removed {
            store.delete(c.address())?;
        }
        let sizes = store.shard_size()?;
        store.close()?;
        (kept.to_vec(), removed.to_vec(), sizes)
    };

    let store = Store::open(config)?;
    assert_eq!(store.count()?, kept.len());
    assert_eq!(store.shard_size()?, sizes);
    for c in &kept {
        assert_eq!(&store.get(c.address())?, c);
    }
    for c in &removed {
        assert!(store.get(c.address()).unwrap_err().is_not_found());
    }

    // Freed slots survive the restart and are reused first
    let before = total_capacity(&store)?;
    for _ in 0..removed.len() {
        store.put(&random_chunk(100))?;
    }
    assert_eq!(total_capacity(&store)?, before);
    assert_eq!(store.check()?.leaked, 0);
    Ok(())
}

#[test]
fn test_cache_does_not_change_results() -> Result<()> {
    let cached_dir = tempfile::tempdir()?;
    let plain_dir = tempfile::tempdir()?;
    let cached = Store::open(test_config(&cached_dir))?;
    let plain = Store::open(test_config(&plain_dir).with_cache(false))?;

    let chunks: Vec<Chunk> = (0..50).map(|_| random_chunk(700)).collect();
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(cached.put(c)?, plain.put(c)?);
        if i % 3 == 0 {
            cached.delete(c.address())?;
            plain.delete(c.address())?;
        }
    }

    for c in &chunks {
        match (cached.get(c.address()), plain.get(c.address())) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(a), Err(b)) => assert!(a.is_not_found() && b.is_not_found()),
            (a, b) => panic!("cache changed the outcome: {:?} vs {:?}", a, b),
        }
    }
    assert_eq!(cached.shard_size()?, plain.shard_size()?);
    assert!(plain.cache_stats().is_none());
    Ok(())
}

#[test]
fn test_close_rejects_further_use() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::open(test_config(&dir))?;
    let chunk = random_chunk(64);
    store.put(&chunk)?;

    store.close()?;
    assert!(matches!(store.get(chunk.address()), Err(Error::Closed)));
    assert!(matches!(store.iterate(|_| Ok(ControlFlow::Continue(()))), Err(Error::Closed)));
    assert!(matches!(store.close(), Err(Error::Closed)));
    Ok(())
}
