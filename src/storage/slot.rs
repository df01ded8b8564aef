//! Slot addressing within shard files

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a shard file
pub type ShardId = u8;

/// Unique location of a slot: the shard and the slot index inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    /// Shard holding the slot
    pub shard: ShardId,
    /// Slot index within the shard file
    pub index: u64,
}

impl SlotId {
    /// Create a new slot ID
    pub fn new(shard: ShardId, index: u64) -> Self {
        Self { shard, index }
    }

    /// Byte offset of this slot inside its shard file
    pub fn offset(&self, slot_size: usize) -> u64 {
        self.index * slot_size as u64
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot(shard={}, index={})", self.shard, self.index)
    }
}

/// Metadata index value: where a chunk lives and how long it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub slot: SlotId,
    /// Payload length in bytes (at most the slot size)
    pub len: u32,
}

impl MetaEntry {
    pub fn new(slot: SlotId, len: u32) -> Self {
        Self { slot, len }
    }

    pub fn shard(&self) -> ShardId {
        self.slot.shard
    }
}
