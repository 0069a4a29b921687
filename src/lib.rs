//! # ftgs
//!
//! Local execution engine for field/term/group/stat (FTGS) aggregation over
//! sharded columnar data.
//!
//! ## Features
//!
//! - Per-shard group assignment with deterministic and salted probabilistic
//!   regrouping
//! - Streaming per-term, per-group stat vectors
//! - Parallel hash split, merge and interleave of many shard streams
//! - Term limits, top-K terms and distinct counting
//! - Cooperative CPU slot scheduling and bounded memory and spill budgets
//! - A transport contract for merging split streams across nodes

pub mod bittree;
pub mod cli;
pub mod config;
pub mod error;
pub mod ftgs;
pub mod group;
pub mod memory;
pub mod regroup;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod shard;
pub mod util;

pub mod prelude {
    pub use crate::config::{EngineConfig, FtgsParams};
    pub use crate::error::{FtgsError, Result};
    pub use crate::ftgs::{BoxedFtgsIterator, FieldSpec, FtgsIterator, FtgsRecord, GroupStats, Term};
    pub use crate::regroup::{GroupMultiRemapRule, RegroupCondition};
    pub use crate::session::{EngineContext, MultiSession};
    pub use crate::shard::{MemoryShard, Shard};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
