//! Bounded parallel execution
//!
//! A fixed-size rayon pool: at most `concurrency` work items run at once
//! and every call returns only after all of its items completed.

use crate::error::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Fixed-size pool of workers pulling items from a batch
pub struct WorkerPool {
    pool: ThreadPool,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::InvalidConfig(
                "worker pool concurrency must be at least 1".to_string(),
            ));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|i| format!("chunkstore-worker-{}", i))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build worker pool: {}", e)))?;

        Ok(Self { pool, concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Apply `f` to every item; results come back in input order
    pub fn run<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool.install(|| items.into_par_iter().map(f).collect())
    }

    /// Like [`run`](Self::run), failing with the first error encountered
    ///
    /// Items already in flight still finish; remaining items may be skipped.
    pub fn try_run<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync,
    {
        self.pool.install(|| items.into_par_iter().map(f).collect())
    }
}
