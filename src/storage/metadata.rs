//! Metadata index: address → (shard, slot, length)
//!
//! The index is the only record of which slots are occupied. Shard free
//! lists are rebuilt from it at open, so it must be durable on its own.
//!
//! # Log format
//!
//! [`LogMetaStore`] keeps no WAL beside itself: every mutation is one
//! atomic batch appended to `meta.log` and fsynced.
//!
//! ```text
//! meta.log:
//! [len u32][Batch 1 JSON: put a1→(0,0)][checksum u32]
//! [len u32][Batch 2 JSON: put a2→(1,0)][checksum u32]
//! [len u32][Batch 3 JSON: delete a1   ][checksum u32]   ← tombstone
//! ```
//!
//! Recovery replays batches in order, last write wins. A torn or corrupt
//! tail ends replay and is cut off.

use super::slot::MetaEntry;
use crate::chunk::Address;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Visitor over index entries; `Break` stops the iteration
pub type MetaVisitor<'a> = dyn FnMut(&Address, &MetaEntry) -> Result<ControlFlow<()>> + 'a;

/// Capabilities the store needs from a metadata index
///
/// Implementations must give read-your-writes consistency within one
/// process. `iterate` walks a stable order and calls the visitor with no
/// internal locks held.
pub trait MetaStore: Send + Sync {
    /// Record the location of a chunk
    fn put(&self, address: &Address, entry: MetaEntry) -> Result<()>;

    /// Look up a chunk location
    fn get(&self, address: &Address) -> Result<Option<MetaEntry>>;

    /// Remove a chunk location; `ChunkNotFound` if absent
    fn delete(&self, address: &Address) -> Result<()>;

    /// Visit every entry
    fn iterate(&self, visit: &mut MetaVisitor<'_>) -> Result<()>;

    /// Number of entries
    fn count(&self) -> Result<usize>;

    /// Release underlying resources
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A single index mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetaRecord {
    Put { address: Address, entry: MetaEntry },
    Delete { address: Address },
}

/// A batch of index mutations, written atomically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataBatch {
    /// Batch sequence number (monotonically increasing)
    pub sequence: u64,
    /// Timestamp (milliseconds since epoch)
    pub timestamp: u64,
    pub records: Vec<MetaRecord>,
}

impl MetadataBatch {
    pub fn new(sequence: u64, records: Vec<MetaRecord>) -> Self {
        Self {
            sequence,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            records,
        }
    }

    /// Serialize as `[4-byte length][json][4-byte checksum]`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json =
            serde_json::to_vec(self).map_err(|e| index_err("Failed to serialize batch", e))?;

        let mut result = Vec::with_capacity(json.len() + 8);
        result.extend_from_slice(&(json.len() as u32).to_le_bytes());
        result.extend_from_slice(&json);
        result.extend_from_slice(&checksum(&json).to_le_bytes());
        Ok(result)
    }

    /// Deserialize a full frame produced by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Index("Batch too short".to_string()));
        }

        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < len + 8 {
            return Err(Error::Index(format!(
                "Incomplete batch: expected {} bytes, got {}",
                len + 8,
                bytes.len()
            )));
        }

        let json = &bytes[4..4 + len];
        let stored = u32::from_le_bytes([
            bytes[4 + len],
            bytes[5 + len],
            bytes[6 + len],
            bytes[7 + len],
        ]);
        if stored != checksum(json) {
            return Err(Error::Index("Checksum mismatch".to_string()));
        }

        serde_json::from_slice(json).map_err(|e| index_err("Failed to deserialize batch", e))
    }
}

/// FNV-1a over the batch payload
fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |acc, &b| {
        (acc ^ b as u32).wrapping_mul(0x0100_0193)
    })
}

fn index_err(context: &str, err: impl Display) -> Error {
    Error::Index(format!("{}: {}", context, err))
}

/// Upper bound on a single batch frame, guards replay against garbage lengths
const MAX_BATCH_LEN: usize = 64 * 1024 * 1024;

/// Records per batch when rewriting the log
const COMPACT_BATCH_RECORDS: usize = 10_000;

/// Rewrite the log once it holds this many records...
const COMPACT_MIN_RECORDS: u64 = 1024;
/// ...and more than this many records per live entry
const COMPACT_RATIO: u64 = 2;

/// Durable metadata index backed by an append-only batch log
///
/// The full index is held in memory as an ordered map; the log is only
/// read at open.
pub struct LogMetaStore {
    log_path: PathBuf,
    sync: bool,
    index: RwLock<BTreeMap<Address, MetaEntry>>,
    writer: Mutex<LogWriter>,
}

struct LogWriter {
    /// `None` once closed
    file: Option<File>,
    next_sequence: u64,
    /// Records currently in the log, live or superseded
    records: u64,
    /// Length of the log up to the last fully written batch
    committed: u64,
}

impl LogMetaStore {
    /// Create or open a metadata log in `base_path`
    pub fn open<P: AsRef<Path>>(base_path: P, sync: bool) -> Result<Self> {
        let base_path = base_path.as_ref();
        std::fs::create_dir_all(base_path)
            .map_err(|e| index_err("Failed to create metadata dir", e))?;

        let log_path = base_path.join("meta.log");
        let recovered = recover(&log_path)?;

        let file = open_append(&log_path)?;
        let store = Self {
            log_path,
            sync,
            index: RwLock::new(recovered.index),
            writer: Mutex::new(LogWriter {
                file: Some(file),
                next_sequence: recovered.max_sequence + 1,
                records: recovered.records,
                committed: recovered.valid_len,
            }),
        };

        let live = store.index.read().len() as u64;
        if recovered.records >= COMPACT_MIN_RECORDS && recovered.records > live * COMPACT_RATIO {
            store.compact()?;
        }

        Ok(store)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Rewrite the log so it holds only live entries
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.file.is_none() {
            return Err(Error::Closed);
        }

        info!(path = ?self.log_path, records = writer.records, "Compacting metadata log");

        let records: Vec<MetaRecord> = self
            .index
            .read()
            .iter()
            .map(|(address, entry)| MetaRecord::Put {
                address: *address,
                entry: *entry,
            })
            .collect();
        let live = records.len() as u64;

        // Split so every frame stays well under MAX_BATCH_LEN
        let mut bytes = Vec::new();
        let mut sequence = 0;
        for part in records.chunks(COMPACT_BATCH_RECORDS) {
            sequence += 1;
            bytes.extend(MetadataBatch::new(sequence, part.to_vec()).to_bytes()?);
        }

        let temp_path = self.log_path.with_extension("log.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| index_err("Failed to create temp log", e))?;
            file.write_all(&bytes)
                .map_err(|e| index_err("Failed to write compacted log", e))?;
            file.sync_all()
                .map_err(|e| index_err("Failed to sync compacted log", e))?;
        }

        std::fs::rename(&temp_path, &self.log_path)
            .map_err(|e| index_err("Failed to rename log", e))?;

        writer.file = Some(open_append(&self.log_path)?);
        writer.next_sequence = sequence + 1;
        writer.records = live;
        writer.committed = bytes.len() as u64;

        info!(live, "Log compaction complete");
        Ok(())
    }

    /// Append one batch and apply it to the in-memory index
    ///
    /// A batch that fails to write is cut off again, so the log never holds
    /// a torn frame in front of later batches.
    fn append(&self, record: MetaRecord) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = &mut *guard;
        let sequence = writer.next_sequence;
        let committed = writer.committed;
        let file = writer.file.as_mut().ok_or(Error::Closed)?;

        discard_uncommitted(file, committed)?;

        let bytes = MetadataBatch::new(sequence, vec![record.clone()]).to_bytes()?;
        if let Err(e) = write_batch(file, &bytes, self.sync) {
            if let Err(trim) = file.set_len(committed) {
                warn!(committed, "Failed to cut off partial metadata batch: {}", trim);
            }
            return Err(e);
        }

        writer.committed += bytes.len() as u64;
        writer.next_sequence += 1;
        writer.records += 1;

        // Applied while the writer lock is held so log order matches index order
        let mut index = self.index.write();
        apply(&mut index, record);

        debug!(sequence, "Wrote metadata batch");
        Ok(())
    }
}

impl MetaStore for LogMetaStore {
    fn put(&self, address: &Address, entry: MetaEntry) -> Result<()> {
        self.append(MetaRecord::Put {
            address: *address,
            entry,
        })
    }

    fn get(&self, address: &Address) -> Result<Option<MetaEntry>> {
        Ok(self.index.read().get(address).copied())
    }

    fn delete(&self, address: &Address) -> Result<()> {
        if !self.index.read().contains_key(address) {
            return Err(Error::ChunkNotFound(*address));
        }
        self.append(MetaRecord::Delete { address: *address })
    }

    fn iterate(&self, visit: &mut MetaVisitor<'_>) -> Result<()> {
        let snapshot: Vec<(Address, MetaEntry)> = self
            .index
            .read()
            .iter()
            .map(|(address, entry)| (*address, *entry))
            .collect();

        for (address, entry) in &snapshot {
            if visit(address, entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.index.read().len())
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let file = writer.file.take().ok_or(Error::Closed)?;
        file.sync_all()
            .map_err(|e| index_err("Failed to sync log on close", e))?;
        info!(path = ?self.log_path, records = writer.records, "Closed metadata log");
        Ok(())
    }
}

fn apply(index: &mut BTreeMap<Address, MetaEntry>, record: MetaRecord) {
    match record {
        MetaRecord::Put { address, entry } => {
            index.insert(address, entry);
        }
        MetaRecord::Delete { address } => {
            index.remove(&address);
        }
    }
}

fn write_batch(file: &mut File, bytes: &[u8], sync: bool) -> Result<()> {
    file.write_all(bytes)
        .map_err(|e| index_err("Failed to write batch", e))?;
    if sync {
        file.sync_data()
            .map_err(|e| index_err("Failed to sync log", e))?;
    }
    Ok(())
}

/// Cut the log back to `committed` if an earlier write left a partial tail
fn discard_uncommitted(file: &File, committed: u64) -> Result<()> {
    let len = file
        .metadata()
        .map_err(|e| index_err("Failed to stat log", e))?
        .len();
    if len < committed {
        return Err(Error::Index(format!(
            "metadata log shrank to {} bytes below committed length {}",
            len, committed
        )));
    }
    if len > committed {
        warn!(len, committed, "Discarding partial metadata batch");
        file.set_len(committed)
            .map_err(|e| index_err("Failed to truncate log", e))?;
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| index_err("Failed to open log", e))
}

struct Recovered {
    index: BTreeMap<Address, MetaEntry>,
    max_sequence: u64,
    records: u64,
    /// Length of the replayed prefix; the file is cut to this
    valid_len: u64,
}

/// Replay the log into an ordered index, cutting off a torn tail
fn recover(log_path: &Path) -> Result<Recovered> {
    let mut recovered = Recovered {
        index: BTreeMap::new(),
        max_sequence: 0,
        records: 0,
        valid_len: 0,
    };

    if !log_path.exists() {
        info!("No metadata log found, starting fresh");
        return Ok(recovered);
    }

    info!(path = ?log_path, "Recovering metadata from log");

    let file = File::open(log_path).map_err(|e| index_err("Failed to open log", e))?;
    let file_len = file
        .metadata()
        .map_err(|e| index_err("Failed to stat log", e))?
        .len();
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    let mut batches = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(index_err("Failed to read batch length", e)),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BATCH_LEN {
            warn!(offset, len, "Metadata batch length out of range");
            break;
        }
        let mut frame = vec![0u8; len + 8];
        frame[0..4].copy_from_slice(&len_bytes);
        if let Err(e) = reader.read_exact(&mut frame[4..]) {
            warn!(offset, "Torn metadata batch: {}", e);
            break;
        }

        match MetadataBatch::from_bytes(&frame) {
            Ok(batch) => {
                recovered.records += batch.records.len() as u64;
                recovered.max_sequence = recovered.max_sequence.max(batch.sequence);
                for record in batch.records {
                    apply(&mut recovered.index, record);
                }
                offset += frame.len() as u64;
                batches += 1;
            }
            Err(e) => {
                warn!(offset, "Corrupt metadata batch: {}", e);
                break;
            }
        }
    }

    if offset < file_len {
        warn!(
            offset,
            file_len, "Truncating metadata log after last valid batch"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(log_path)
            .map_err(|e| index_err("Failed to open log for truncation", e))?;
        file.set_len(offset)
            .map_err(|e| index_err("Failed to truncate log", e))?;
    }
    recovered.valid_len = offset;

    info!(
        batches,
        records = recovered.records,
        keys = recovered.index.len(),
        next_sequence = recovered.max_sequence + 1,
        "Metadata recovery complete"
    );

    Ok(recovered)
}
