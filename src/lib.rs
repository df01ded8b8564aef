// Chunkstore - content-addressed chunk storage
// Fixed-size slots spread over a fixed number of append-only shard files

#![warn(rust_2018_idioms)]

pub mod chunk;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod storage;

// Re-exports for convenience
pub use chunk::{Address, Chunk, ADDRESS_LENGTH};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use pool::WorkerPool;
pub use storage::{
    ChunkCache, ConsistencyReport, LogMetaStore, LruChunkCache, MemoryMetaStore, MetaEntry,
    MetaStore, ShardId, ShardInfo, SlotId, Store,
};

/// Chunkstore error types
pub mod error {
    use crate::chunk::Address;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Chunk not found: {0}")]
        ChunkNotFound(Address),

        #[error("Payload too large: {size} bytes exceeds maximum chunk size {max}")]
        PayloadTooLarge { size: usize, max: usize },

        #[error("Storage I/O error: {0}")]
        StorageIo(#[from] std::io::Error),

        #[error("Index error: {0}")]
        Index(String),

        #[error("Store is closed")]
        Closed,

        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Inconsistent store state: {0}")]
        Inconsistent(String),

        #[error("{0} cannot be called from inside an iterate visitor")]
        Reentrant(&'static str),
    }

    impl Error {
        /// True for the "missing" outcome, as opposed to a broken store
        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::ChunkNotFound(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
