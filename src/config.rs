//! Store configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file,
//! then `CHUNKSTORE_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default slot size, matching the usual 4 KiB chunk
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_SHARD_COUNT: u8 = 4;
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Construction parameters of a [`Store`](crate::Store)
///
/// `shard_count` and `max_chunk_size` are fixed for the lifetime of the
/// data directory; reopening with different values is not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding the shard files and the metadata log
    pub storage_path: PathBuf,
    /// Number of shard files (and write concurrency units)
    pub shard_count: u8,
    /// Slot size in bytes; larger payloads are rejected
    pub max_chunk_size: usize,
    /// Enable the in-memory read cache
    pub cache_enabled: bool,
    /// Maximum number of cached chunks
    pub cache_capacity: usize,
    /// Fsync shard data and metadata on every mutation
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data/chunkstore"),
            shard_count: DEFAULT_SHARD_COUNT,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            cache_enabled: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at the given directory
    pub fn new<P: AsRef<Path>>(storage_path: P) -> Self {
        Self {
            storage_path: storage_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| Error::InvalidConfig(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CHUNKSTORE")
                .prefix_separator("_")
                .try_parsing(true),
        );

        let cfg: StoreConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_shard_count(mut self, shard_count: u8) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Reject parameters the store cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::InvalidConfig(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.max_chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "max_chunk_size must be greater than 0".to_string(),
            ));
        }
        // Payload lengths are recorded as u32
        if self.max_chunk_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_chunk_size {} exceeds {}",
                self.max_chunk_size,
                u32::MAX
            )));
        }
        if self.cache_enabled && self.cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "cache_capacity must be at least 1 when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory handed to the default metadata store
    pub fn meta_path(&self) -> PathBuf {
        self.storage_path.join("meta")
    }
}
