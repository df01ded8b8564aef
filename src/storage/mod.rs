//! Chunk storage
//!
//! Chunks live in fixed-size slots spread over a fixed number of shard
//! files. A chunk never spans slots, and a freed slot is reused before any
//! shard grows.
//!
//! # Architecture
//!
//! ```text
//! Store
//!   ├─→ Shard 0  shard_0000.bin  → Free: [3, 7]
//!   ├─→ Shard 1  shard_0001.bin  → Free: []
//!   ├─→ Shard 2  shard_0002.bin  → Free: [1]
//!   └─→ Shard 3  shard_0003.bin  → Free: []
//!
//! MetaStore (meta/meta.log, no WAL)
//!   └─→ a1 → SlotId(shard=0, index=2), len 4000
//!   └─→ a2 → SlotId(shard=2, index=0), len 812
//!
//! ChunkCache (optional LRU, invalidated on delete)
//! ```
//!
//! Shard selection: the shard with the most free slots wins; when none has
//! a free slot, the smallest shard grows by one slot. Ties go to the lowest
//! shard id.

pub mod allocator;
pub mod cache;
pub mod memory;
pub mod metadata;
pub mod selector;
pub mod shard;
pub mod slot;
pub mod store;

pub use allocator::SlotAllocator;
pub use cache::{CacheStats, ChunkCache, LruChunkCache};
pub use memory::MemoryMetaStore;
pub use metadata::{LogMetaStore, MetaRecord, MetaStore, MetaVisitor, MetadataBatch};
pub use selector::{select_shard, ShardStat};
pub use shard::Shard;
pub use slot::{MetaEntry, ShardId, SlotId};
pub use store::{ConsistencyReport, ShardInfo, ShardReport, Store};
