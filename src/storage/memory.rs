//! In-memory metadata index
//!
//! Volatile: nothing survives a restart. Used for ephemeral stores and
//! in tests.

use super::metadata::{MetaStore, MetaVisitor};
use super::slot::MetaEntry;
use crate::chunk::Address;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Ordered in-memory metadata index
#[derive(Default)]
pub struct MemoryMetaStore {
    entries: RwLock<BTreeMap<Address, MetaEntry>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MetaStore for MemoryMetaStore {
    fn put(&self, address: &Address, entry: MetaEntry) -> Result<()> {
        self.entries.write().insert(*address, entry);
        Ok(())
    }

    fn get(&self, address: &Address) -> Result<Option<MetaEntry>> {
        Ok(self.entries.read().get(address).copied())
    }

    fn delete(&self, address: &Address) -> Result<()> {
        match self.entries.write().remove(address) {
            Some(_) => Ok(()),
            None => Err(Error::ChunkNotFound(*address)),
        }
    }

    fn iterate(&self, visit: &mut MetaVisitor<'_>) -> Result<()> {
        let snapshot: Vec<(Address, MetaEntry)> =
            self.entries.read().iter().map(|(a, e)| (*a, *e)).collect();

        for (address, entry) in &snapshot {
            if visit(address, entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.len())
    }
}
