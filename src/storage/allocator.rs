//! Per-shard slot allocator
//!
//! Pure bookkeeping: tracks how many slots a shard file holds and which
//! of them are free. No I/O happens here; the owning [`Shard`] guards it
//! with its lock.
//!
//! [`Shard`]: super::shard::Shard

use crate::error::{Error, Result};

/// Free list and capacity tracker for one shard
///
/// Free slots are reused last-in first-out, so the most recently released
/// slot is handed out next. Capacity only ever grows.
#[derive(Debug)]
pub struct SlotAllocator {
    /// Size of every slot in bytes
    slot_size: usize,
    /// Slots currently backed by the file (free + occupied)
    total_slots: u64,
    /// Free slot indices, popped from the back
    free: Vec<u64>,
    /// Membership map for `free`, indexed by slot
    is_free: Vec<bool>,
}

/// Outcome of [`SlotAllocator::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub index: u64,
    /// True when the slot was appended at the capacity boundary
    pub grown: bool,
}

impl SlotAllocator {
    /// Allocator for an empty shard
    pub fn new(slot_size: usize) -> Self {
        Self {
            slot_size,
            total_slots: 0,
            free: Vec::new(),
            is_free: Vec::new(),
        }
    }

    /// Rebuild an allocator from the slots referenced by the metadata index
    ///
    /// Every slot in `[0, total_slots)` that is not listed in `occupied`
    /// becomes free. Lower indices are reused first.
    pub fn restore<I>(slot_size: usize, total_slots: u64, occupied: I) -> Result<Self>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut is_free = vec![true; total_slots as usize];
        for index in occupied {
            if index >= total_slots {
                return Err(Error::Inconsistent(format!(
                    "slot {} is beyond shard capacity of {} slots",
                    index, total_slots
                )));
            }
            if !is_free[index as usize] {
                return Err(Error::Inconsistent(format!(
                    "slot {} is referenced more than once",
                    index
                )));
            }
            is_free[index as usize] = false;
        }

        let free = (0..total_slots).rev().filter(|&i| is_free[i as usize]).collect();

        Ok(Self {
            slot_size,
            total_slots,
            free,
            is_free,
        })
    }

    /// Hand out a slot, reusing a free one before growing
    pub fn reserve(&mut self) -> Reservation {
        if let Some(index) = self.free.pop() {
            self.is_free[index as usize] = false;
            return Reservation {
                index,
                grown: false,
            };
        }

        let index = self.total_slots;
        self.total_slots += 1;
        self.is_free.push(false);
        Reservation { index, grown: true }
    }

    /// Return an occupied slot to the free list
    pub fn release(&mut self, index: u64) -> Result<()> {
        if index >= self.total_slots {
            return Err(Error::Inconsistent(format!(
                "release of slot {} beyond capacity of {} slots",
                index, self.total_slots
            )));
        }
        if self.is_free[index as usize] {
            return Err(Error::Inconsistent(format!(
                "double release of slot {}",
                index
            )));
        }

        self.is_free[index as usize] = true;
        self.free.push(index);
        Ok(())
    }

    /// Whether the next reservation has to grow the shard
    pub fn needs_growth(&self) -> bool {
        self.free.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.total_slots * self.slot_size as u64
    }

    pub fn total_slots(&self) -> u64 {
        self.total_slots
    }

    pub fn occupied_count(&self) -> u64 {
        self.total_slots - self.free.len() as u64
    }

    pub fn is_free(&self, index: u64) -> bool {
        self.is_free.get(index as usize).copied().unwrap_or(false)
    }

    /// Free slot indices in reuse order (next to be handed out first)
    pub fn free_slots(&self) -> impl Iterator<Item = u64> + '_ {
        self.free.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_grows_when_empty() {
        let mut alloc = SlotAllocator::new(4096);

        assert_eq!(alloc.reserve(), Reservation { index: 0, grown: true });
        assert_eq!(alloc.reserve(), Reservation { index: 1, grown: true });
        assert_eq!(alloc.reserve(), Reservation { index: 2, grown: true });

        assert_eq!(alloc.total_slots(), 3);
        assert_eq!(alloc.capacity(), 3 * 4096);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_release_then_reuse_without_growth() -> Result<()> {
        let mut alloc = SlotAllocator::new(64);

        let first = alloc.reserve().index;
        let _second = alloc.reserve().index;

        alloc.release(first)?;
        assert_eq!(alloc.free_count(), 1);
        assert!(alloc.is_free(first));

        let reused = alloc.reserve();
        assert_eq!(reused, Reservation { index: first, grown: false });
        assert_eq!(alloc.free_count(), 0);
        // Capacity did not move
        assert_eq!(alloc.capacity(), 2 * 64);

        assert_eq!(alloc.reserve().index, 2);
        Ok(())
    }

    #[test]
    fn test_most_recently_freed_reused_first() -> Result<()> {
        let mut alloc = SlotAllocator::new(64);
        for _ in 0..4 {
            alloc.reserve();
        }

        alloc.release(1)?;
        alloc.release(3)?;

        assert_eq!(alloc.reserve().index, 3);
        assert_eq!(alloc.reserve().index, 1);
        Ok(())
    }

    #[test]
    fn test_double_release_rejected() -> Result<()> {
        let mut alloc = SlotAllocator::new(64);
        let idx = alloc.reserve().index;

        alloc.release(idx)?;
        assert!(matches!(alloc.release(idx), Err(Error::Inconsistent(_))));
        assert_eq!(alloc.free_count(), 1);
        Ok(())
    }

    #[test]
    fn test_release_beyond_capacity_rejected() {
        let mut alloc = SlotAllocator::new(64);
        alloc.reserve();
        assert!(matches!(alloc.release(5), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn test_restore_marks_unreferenced_free() -> Result<()> {
        let alloc = SlotAllocator::restore(128, 6, vec![0, 2, 5])?;

        assert_eq!(alloc.total_slots(), 6);
        assert_eq!(alloc.free_count(), 3);
        assert_eq!(alloc.occupied_count(), 3);
        assert_eq!(alloc.free_slots().collect::<Vec<_>>(), vec![1, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_restore_reuses_lowest_first() -> Result<()> {
        let mut alloc = SlotAllocator::restore(128, 4, vec![1])?;

        assert_eq!(alloc.reserve().index, 0);
        assert_eq!(alloc.reserve().index, 2);
        assert_eq!(alloc.reserve().index, 3);
        assert_eq!(alloc.reserve(), Reservation { index: 4, grown: true });
        Ok(())
    }

    #[test]
    fn test_restore_rejects_bad_references() {
        assert!(matches!(
            SlotAllocator::restore(128, 2, vec![2]),
            Err(Error::Inconsistent(_))
        ));
        assert!(matches!(
            SlotAllocator::restore(128, 4, vec![1, 1]),
            Err(Error::Inconsistent(_))
        ));
    }
}
