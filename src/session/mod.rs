//! Sessions: one shard ([`LocalSession`]) and many shards
//! ([`MultiSession`]).
//!
//! A multi-session fans work out to its local sessions on the engine's
//! worker pool, then combines their FTGS streams through the parallel
//! split → merge → persist → interleave pipeline.

pub mod iterator;
pub mod local;
pub mod multi;
pub mod tasks;

use std::sync::Arc;

use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::EngineConfig;
use crate::error::{FtgsError, Result};
use crate::scheduler::CpuScheduler;

pub use iterator::ShardFtgsIterator;
pub use local::{LocalSession, StatChange, TermSubset};
pub use multi::MultiSession;
pub use tasks::{TaskOutput, execute};

/// Process-wide engine resources shared by every session.
#[derive(Debug)]
pub struct EngineContext {
    config: EngineConfig,
    scheduler: Arc<CpuScheduler>,
    pool: Arc<ThreadPool>,
}

impl EngineContext {
    /// Build the worker pool and CPU scheduler described by `config`.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let threads = config.worker_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ftgs-worker-{i}"))
            .build()
            .map_err(|e| FtgsError::ThreadPool(format!("Failed to create thread pool: {e}")))?;
        let scheduler = CpuScheduler::new(config.cpu_slots);
        info!(
            "Engine started: {threads} workers, {} cpu slots, {} merge splits",
            scheduler.slots(),
            config.merge_splits()
        );

        Ok(Arc::new(EngineContext {
            config,
            scheduler,
            pool: Arc::new(pool),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<CpuScheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}
