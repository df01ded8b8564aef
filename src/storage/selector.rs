//! Shard selection policy
//!
//! Decides which shard receives the next chunk from a snapshot of every
//! shard's free slot count and capacity. Two tiers, in order:
//!
//! 1. Reclaim first: if any shard has free slots, pick the one with the
//!    most free slots.
//! 2. Grow the smallest: otherwise pick the shard with the least capacity.
//!
//! Ties go to the lowest shard id in both tiers.

use super::slot::ShardId;
use std::cmp::Reverse;

/// Point-in-time accounting of one shard, as seen by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStat {
    pub shard: ShardId,
    pub free_slots: u64,
    /// Capacity in bytes
    pub capacity: u64,
}

/// Pick the shard for the next write; `None` only for an empty snapshot
pub fn select_shard(stats: &[ShardStat]) -> Option<ShardId> {
    reclaim(stats).or_else(|| grow_smallest(stats))
}

fn reclaim(stats: &[ShardStat]) -> Option<ShardId> {
    stats
        .iter()
        .filter(|s| s.free_slots > 0)
        .min_by_key(|s| (Reverse(s.free_slots), s.shard))
        .map(|s| s.shard)
}

fn grow_smallest(stats: &[ShardStat]) -> Option<ShardId> {
    stats
        .iter()
        .min_by_key(|s| (s.capacity, s.shard))
        .map(|s| s.shard)
}
