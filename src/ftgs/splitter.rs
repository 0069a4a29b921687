//! Hash-partitioning of an FTGS stream into disjoint buckets.
//!
//! Every term goes to bucket `xxh3(term bytes, SPLIT_SEED) % num_splits`.
//! The seed is fixed so that every splitter on every node agrees on where a
//! term lives; merging bucket `j` of many streams then sees every occurrence
//! of its terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{FtgsError, Result};
use crate::ftgs::codec::StreamHeader;
use crate::ftgs::iterator::{BoxedFtgsIterator, FtgsIterator};
use crate::ftgs::spill::SpillWriter;
use crate::ftgs::types::{FieldSpec, FtgsRecord, Term};
use crate::memory::TempBudget;

/// Seed shared by every splitter.
pub const SPLIT_SEED: u64 = 981_044_833;

/// Bucket of `term` among `num_splits` buckets.
#[inline]
pub fn split_index(term: &Term, num_splits: usize) -> usize {
    let hash = term.with_bytes(|bytes| xxh3_64_with_seed(bytes, SPLIT_SEED));
    (hash % num_splits.max(1) as u64) as usize
}

/// Consume `iterator` once and spool it into `num_splits` independent
/// buckets. Each bucket keeps the source's fields, stat count, group count
/// and ordering.
///
/// The source is closed on every path. On failure every partial bucket is
/// deleted and its temp bytes refunded.
pub fn split<I: FtgsIterator + ?Sized>(
    iterator: &mut I,
    num_splits: usize,
    budget: &TempBudget,
) -> Result<Vec<BoxedFtgsIterator>> {
    let result = (|| {
        if num_splits == 0 {
            return Err(FtgsError::invalid_argument("num_splits must be positive"));
        }

        let header = StreamHeader::of(iterator);
        let mut writers = (0..num_splits)
            .map(|_| SpillWriter::new(header.clone(), budget))
            .collect::<Result<Vec<_>>>()?;

        let mut records = 0u64;
        while let Some(record) = iterator.next_record()? {
            writers[split_index(&record.term, num_splits)].write(&record)?;
            records += 1;
        }
        debug!("Split {records} records into {num_splits} buckets");

        writers
            .into_iter()
            .map(|w| w.finish().map(|spilled| Box::new(spilled) as BoxedFtgsIterator))
            .collect::<Result<Vec<_>>>()
    })();
    iterator.close();
    result
}

/// Holds the buckets of one split stream and hands each out exactly once.
///
/// Used to serve split requests from other nodes: every node asks for
/// bucket `j`, the first request for a bucket takes it. The splitter counts
/// as closed once every bucket has been closed, whether by its taker or by
/// [`FtgsSplitter::close`].
pub struct FtgsSplitter {
    fields: Arc<[FieldSpec]>,
    outputs: Vec<Option<BoxedFtgsIterator>>,
    open: Arc<AtomicUsize>,
}

impl FtgsSplitter {
    /// Split `iterator` eagerly into `num_splits` buckets.
    pub fn new<I: FtgsIterator + ?Sized>(
        iterator: &mut I,
        num_splits: usize,
        budget: &TempBudget,
    ) -> Result<Self> {
        let fields: Arc<[FieldSpec]> = iterator.fields().into();
        let buckets = split(iterator, num_splits, budget)?;
        let open = Arc::new(AtomicUsize::new(buckets.len()));
        let outputs = buckets
            .into_iter()
            .map(|inner| {
                Some(Box::new(SplitOutput {
                    inner,
                    open: Arc::clone(&open),
                    closed: false,
                }) as BoxedFtgsIterator)
            })
            .collect();
        Ok(FtgsSplitter {
            fields,
            outputs,
            open,
        })
    }

    pub fn num_splits(&self) -> usize {
        self.outputs.len()
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Take bucket `index`. Each bucket can be taken once.
    pub fn take(&mut self, index: usize) -> Result<BoxedFtgsIterator> {
        let num_splits = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            FtgsError::invalid_argument(format!(
                "split index {index} out of range for {num_splits} splits"
            ))
        })?;
        slot.take()
            .ok_or_else(|| FtgsError::illegal_state(format!("split {index} was already taken")))
    }

    /// Close every bucket not handed out yet.
    pub fn close(&mut self) {
        for slot in self.outputs.iter_mut() {
            if let Some(mut output) = slot.take() {
                output.close();
            }
        }
    }

    /// Whether every bucket has been closed.
    pub fn is_closed(&self) -> bool {
        self.open.load(Ordering::Acquire) == 0
    }
}

impl Drop for FtgsSplitter {
    fn drop(&mut self) {
        self.close();
    }
}

struct SplitOutput {
    inner: BoxedFtgsIterator,
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl FtgsIterator for SplitOutput {
    fn fields(&self) -> &[FieldSpec] {
        self.inner.fields()
    }

    fn num_stats(&self) -> usize {
        self.inner.num_stats()
    }

    fn num_groups(&self) -> u32 {
        self.inner.num_groups()
    }

    fn is_sorted(&self) -> bool {
        self.inner.is_sorted()
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        self.inner.next_record()
    }

    fn close(&mut self) {
        self.inner.close();
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SplitOutput {
    fn drop(&mut self) {
        self.close();
    }
}
