//! Shard: one append-only file of fixed-size slots
//!
//! All slot I/O and allocator bookkeeping for a shard is serialized by a
//! single mutex, making a shard the unit of write concurrency.

use super::allocator::SlotAllocator;
use super::selector::ShardStat;
use super::slot::ShardId;
use crate::error::{Error, Result};
use crate::metrics;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Backing file plus allocator for one shard
pub struct Shard {
    id: ShardId,
    path: PathBuf,
    /// Storage directory, used as the metrics label of the owning store
    store_label: String,
    slot_size: usize,
    sync_writes: bool,
    state: Mutex<ShardState>,
}

struct ShardState {
    file: File,
    allocator: SlotAllocator,
}

/// Snapshot of a shard's slot accounting, used by consistency checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub total_slots: u64,
    pub free_slots: Vec<u64>,
}

impl Shard {
    /// File name of a shard inside the storage directory
    pub fn file_name(id: ShardId) -> String {
        format!("shard_{:04}.bin", id)
    }

    /// Open or create the shard file and rebuild its free list
    ///
    /// `occupied` lists the slot indices referenced by the metadata index.
    /// A file whose length is not a whole number of slots is extended to
    /// the next slot boundary so capacity always equals file length.
    pub fn open<P, I>(
        dir: P,
        id: ShardId,
        slot_size: usize,
        sync_writes: bool,
        occupied: I,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = u64>,
    {
        let path = dir.as_ref().join(Self::file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let slot = slot_size as u64;
        let total_slots = len.div_ceil(slot);
        if len % slot != 0 {
            warn!(
                shard = id,
                len,
                slot_size,
                "Shard file is not slot aligned, extending to slot boundary"
            );
            file.set_len(total_slots * slot)?;
        }

        let allocator = SlotAllocator::restore(slot_size, total_slots, occupied)
            .map_err(|e| in_shard(id, e))?;

        info!(
            shard = id,
            path = ?path,
            total_slots,
            free_slots = allocator.free_count(),
            "Opened shard"
        );

        let shard = Self {
            id,
            path,
            store_label: dir.as_ref().display().to_string(),
            slot_size,
            sync_writes,
            state: Mutex::new(ShardState { file, allocator }),
        };
        shard.publish(&shard.state.lock().allocator);
        Ok(shard)
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a payload into an already reserved slot
    pub fn write(&self, index: u64, payload: &[u8]) -> Result<()> {
        self.check_payload(payload)?;

        let mut state = self.state.lock();
        if index >= state.allocator.total_slots() {
            return Err(Error::Inconsistent(format!(
                "write to slot {} beyond shard {} capacity of {} slots",
                index,
                self.id,
                state.allocator.total_slots()
            )));
        }
        self.write_slot(&mut state.file, index, payload)
    }

    /// Read `len` bytes from the start of a slot
    pub fn read(&self, index: u64, len: usize) -> Result<Bytes> {
        if len > self.slot_size {
            return Err(Error::Inconsistent(format!(
                "read of {} bytes exceeds slot size {}",
                len, self.slot_size
            )));
        }

        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(index * self.slot_size as u64))?;

        let mut data = vec![0u8; len];
        state.file.read_exact(&mut data)?;

        debug!(shard = self.id, slot = index, len, "Read slot");
        Ok(Bytes::from(data))
    }

    /// Reserve a slot and write the payload into it, atomically
    ///
    /// On a write failure the slot goes back to the free list; capacity
    /// added for it is kept.
    pub fn reserve_and_write(&self, payload: &[u8]) -> Result<u64> {
        self.check_payload(payload)?;

        let mut guard = self.state.lock();
        let ShardState { file, allocator } = &mut *guard;

        if allocator.needs_growth() {
            file.set_len(allocator.capacity() + self.slot_size as u64)?;
        }
        let reservation = allocator.reserve();

        if let Err(e) = self.write_slot(file, reservation.index, payload) {
            allocator.release(reservation.index)?;
            self.publish(allocator);
            return Err(e);
        }

        self.publish(allocator);
        debug!(
            shard = self.id,
            slot = reservation.index,
            grown = reservation.grown,
            len = payload.len(),
            "Reserved and wrote slot"
        );
        Ok(reservation.index)
    }

    /// Return a slot to the free list
    pub fn release(&self, index: u64) -> Result<()> {
        let mut state = self.state.lock();
        state
            .allocator
            .release(index)
            .map_err(|e| in_shard(self.id, e))?;
        self.publish(&state.allocator);
        debug!(shard = self.id, slot = index, "Released slot");
        Ok(())
    }

    /// Current capacity in bytes (equals the file length)
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().allocator.capacity()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().allocator.free_count()
    }

    /// Free count and capacity read under one lock acquisition
    pub fn stat(&self) -> ShardStat {
        let state = self.state.lock();
        ShardStat {
            shard: self.id,
            free_slots: state.allocator.free_count() as u64,
            capacity: state.allocator.capacity(),
        }
    }

    pub fn slot_snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock();
        SlotSnapshot {
            total_slots: state.allocator.total_slots(),
            free_slots: state.allocator.free_slots().collect(),
        }
    }

    /// Flush the shard file to disk
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        state.file.sync_all()?;
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.slot_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: self.slot_size,
            });
        }
        Ok(())
    }

    fn write_slot(&self, file: &mut File, index: u64, payload: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(index * self.slot_size as u64))?;
        file.write_all(payload)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    fn publish(&self, allocator: &SlotAllocator) {
        metrics::record_shard(
            &self.store_label,
            self.id,
            allocator.capacity(),
            allocator.free_count(),
        );
    }
}

/// Accounting of every shard, read while holding all shard locks at once
///
/// Locks are taken in slice order; this is the only place more than one
/// shard lock is held.
pub fn snapshot_stats(shards: &[Shard]) -> Vec<ShardStat> {
    let guards: Vec<_> = shards.iter().map(|s| s.state.lock()).collect();
    shards
        .iter()
        .zip(&guards)
        .map(|(shard, state)| ShardStat {
            shard: shard.id,
            free_slots: state.allocator.free_count() as u64,
            capacity: state.allocator.capacity(),
        })
        .collect()
}

/// Prefix allocator inconsistencies with the shard they happened in
fn in_shard(id: ShardId, err: Error) -> Error {
    match err {
        Error::Inconsistent(msg) => Error::Inconsistent(format!("shard {}: {}", id, msg)),
        other => other,
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("slot_size", &self.slot_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_empty(dir: &Path, id: ShardId) -> Result<Shard> {
        Shard::open(dir, id, 64, false, Vec::new())
    }

    #[test]
    fn test_reserve_write_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 0)?;

        let idx = shard.reserve_and_write(b"Hello, Shard!")?;
        assert_eq!(idx, 0);
        assert_eq!(&shard.read(idx, 13)?[..], b"Hello, Shard!");
        assert_eq!(shard.size_bytes(), 64);

        // File length tracks capacity
        let len = std::fs::metadata(shard.path())?.len();
        assert_eq!(len, 64);
        Ok(())
    }

    #[test]
    fn test_release_reuses_without_growth() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 1)?;

        let a = shard.reserve_and_write(b"aaaa")?;
        let _b = shard.reserve_and_write(b"bbbb")?;
        assert_eq!(shard.size_bytes(), 128);

        shard.release(a)?;
        assert_eq!(shard.free_count(), 1);

        let c = shard.reserve_and_write(b"cc")?;
        assert_eq!(c, a);
        assert_eq!(shard.size_bytes(), 128);
        assert_eq!(&shard.read(c, 2)?[..], b"cc");
        Ok(())
    }

    #[test]
    fn test_payload_too_large() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 0)?;

        let big = vec![7u8; 65];
        assert!(matches!(
            shard.reserve_and_write(&big),
            Err(Error::PayloadTooLarge { size: 65, max: 64 })
        ));
        assert_eq!(shard.size_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_double_release_is_inconsistent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 0)?;

        let idx = shard.reserve_and_write(b"x")?;
        shard.release(idx)?;
        assert!(matches!(shard.release(idx), Err(Error::Inconsistent(_))));
        Ok(())
    }

    #[test]
    fn test_write_outside_capacity_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 0)?;

        assert!(matches!(shard.write(3, b"nope"), Err(Error::Inconsistent(_))));

        let idx = shard.reserve_and_write(b"first")?;
        shard.write(idx, b"again")?;
        assert_eq!(&shard.read(idx, 5)?[..], b"again");
        Ok(())
    }

    #[test]
    fn test_reopen_restores_free_list() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let shard = open_empty(dir.path(), 2)?;
            for i in 0..4u8 {
                shard.reserve_and_write(&[i; 8])?;
            }
            shard.flush()?;
        }

        // Only slots 0 and 3 are still referenced
        let shard = Shard::open(dir.path(), 2, 64, false, vec![0, 3])?;
        assert_eq!(shard.size_bytes(), 4 * 64);
        assert_eq!(shard.free_count(), 2);
        assert_eq!(&shard.read(3, 8)?[..], &[3u8; 8]);

        assert_eq!(shard.reserve_and_write(b"new")?, 1);
        Ok(())
    }

    #[test]
    fn test_unaligned_file_extended() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(Shard::file_name(0)), vec![1u8; 100])?;

        let shard = Shard::open(dir.path(), 0, 64, false, vec![0])?;
        assert_eq!(shard.size_bytes(), 128);
        assert_eq!(std::fs::metadata(shard.path())?.len(), 128);
        assert_eq!(shard.free_count(), 1);
        Ok(())
    }

    #[test]
    fn test_gauges_labelled_by_directory() -> Result<()> {
        metrics::init_metrics();
        let (a, b) = (tempfile::tempdir()?, tempfile::tempdir()?);
        let left = open_empty(a.path(), 0)?;
        let right = open_empty(b.path(), 0)?;

        left.reserve_and_write(b"x")?;
        right.reserve_and_write(b"x")?;
        right.reserve_and_write(b"y")?;

        let capacity = |dir: &Path| {
            let label = dir.display().to_string();
            metrics::SHARD_CAPACITY_BYTES
                .with_label_values(&[label.as_str(), "0"])
                .get()
        };
        assert_eq!(capacity(a.path()), 64);
        assert_eq!(capacity(b.path()), 128);
        Ok(())
    }

    #[test]
    fn test_stat_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shard = open_empty(dir.path(), 3)?;
        shard.reserve_and_write(b"a")?;
        let b = shard.reserve_and_write(b"b")?;
        shard.release(b)?;

        let stat = shard.stat();
        assert_eq!(stat.shard, 3);
        assert_eq!(stat.free_slots, 1);
        assert_eq!(stat.capacity, 128);

        let snap = shard.slot_snapshot();
        assert_eq!(snap.total_slots, 2);
        assert_eq!(snap.free_slots, vec![b]);
        Ok(())
    }
}
