//! Per-shard group and metric storage.
//!
//! - [`PackedTable`]: owned row-major buffer of group + narrow stat columns
//! - [`GroupLookup`]: document → group mutation, bulk reads, regroup primitives
//! - [`MultiCache`]: builds the table from the stat stack and claims its memory
//! - [`GroupStatsPool`]: shared accumulation buffers for concurrent shard tasks

pub mod lookup;
pub mod multicache;
pub mod packed;
pub mod pool;

pub use lookup::{ConditionMatch, GroupLookup, UNMATCHED};
pub use multicache::{CachedMetric, MultiCache};
pub use packed::PackedTable;
pub use pool::GroupStatsPool;
