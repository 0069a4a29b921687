//! Field/Term/Group/Stat streams and the operators that combine them.
//!
//! This module provides:
//! - The record types and the [`FtgsIterator`] capability trait
//! - A compact stream codec and disk spill for memory bounding
//! - Splitting a stream into disjoint hash buckets
//! - K-way merge-summing of sorted streams
//! - Sorted and unsorted interleaving of bucket streams
//! - Arrival-order term limits and top-K term selection
//! - Distinct term counting

pub mod codec;
pub mod distinct;
pub mod interleaver;
pub mod iterator;
pub mod limit;
pub mod merger;
pub mod spill;
pub mod splitter;
pub mod types;

pub use distinct::calculate_distinct;
pub use interleaver::{SortedInterleaver, UnsortedInterleaver};
pub use iterator::{BoxedFtgsIterator, FtgsIterator, VecFtgsIterator, close_all, drain};
pub use limit::{TermLimitedIterator, top_terms};
pub use merger::FtgsMerger;
pub use spill::{SpilledFtgsIterator, persist};
pub use splitter::{FtgsSplitter, SPLIT_SEED, split, split_index};
pub use types::{FieldKind, FieldSpec, FtgsRecord, GroupStats, Term};
