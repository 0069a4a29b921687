//! The FTGS iterator capability and a materialized implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{FtgsError, Result};
use crate::ftgs::types::{FieldSpec, FtgsRecord};

/// A lazy, single-pass producer of FTGS records.
///
/// Records come grouped by field (in `fields()` order), then by term
/// (ascending when `is_sorted()`), with groups ascending inside a record.
/// Fields without terms produce no records.
pub trait FtgsIterator: Send {
    /// Fields of the stream; record `field` values index into this.
    fn fields(&self) -> &[FieldSpec];

    /// Length of every stat vector.
    fn num_stats(&self) -> usize;

    /// Exclusive upper bound of the group ids that may appear.
    fn num_groups(&self) -> u32;

    /// Whether terms are strictly ascending within each field.
    fn is_sorted(&self) -> bool;

    /// Produce the next record, or `None` when exhausted.
    ///
    /// Fails with [`FtgsError::IllegalState`] once the iterator is closed.
    fn next_record(&mut self) -> Result<Option<FtgsRecord>>;

    /// Release underlying resources. Closing twice is a no-op.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Owned, type-erased iterator.
pub type BoxedFtgsIterator = Box<dyn FtgsIterator>;

impl<I: FtgsIterator + ?Sized> FtgsIterator for Box<I> {
    fn fields(&self) -> &[FieldSpec] {
        (**self).fields()
    }

    fn num_stats(&self) -> usize {
        (**self).num_stats()
    }

    fn num_groups(&self) -> u32 {
        (**self).num_groups()
    }

    fn is_sorted(&self) -> bool {
        (**self).is_sorted()
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        (**self).next_record()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Close every iterator in `iterators`.
pub fn close_all(iterators: &mut [BoxedFtgsIterator]) {
    for iterator in iterators.iter_mut() {
        iterator.close();
    }
}

/// Read every remaining record and close the iterator.
pub fn drain<I: FtgsIterator + ?Sized>(iterator: &mut I) -> Result<Vec<FtgsRecord>> {
    let mut records = Vec::new();
    let result = loop {
        match iterator.next_record() {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break Ok(records),
            Err(e) => break Err(e),
        }
    };
    iterator.close();
    result
}

pub(crate) fn closed_error(what: &str) -> FtgsError {
    FtgsError::illegal_state(format!("{what} used after close"))
}

/// An iterator over records already held in memory.
#[derive(Debug)]
pub struct VecFtgsIterator {
    fields: Arc<[FieldSpec]>,
    num_stats: usize,
    num_groups: u32,
    sorted: bool,
    records: VecDeque<FtgsRecord>,
    closed: bool,
}

impl VecFtgsIterator {
    pub fn new(
        fields: impl Into<Arc<[FieldSpec]>>,
        num_stats: usize,
        num_groups: u32,
        sorted: bool,
        records: Vec<FtgsRecord>,
    ) -> Self {
        VecFtgsIterator {
            fields: fields.into(),
            num_stats,
            num_groups,
            sorted,
            records: records.into(),
            closed: false,
        }
    }

    /// An empty stream over `fields`.
    pub fn empty(fields: impl Into<Arc<[FieldSpec]>>, num_stats: usize, num_groups: u32) -> Self {
        Self::new(fields, num_stats, num_groups, true, Vec::new())
    }

    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl FtgsIterator for VecFtgsIterator {
    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn num_stats(&self) -> usize {
        self.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.num_groups
    }

    fn is_sorted(&self) -> bool {
        self.sorted
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        if self.closed {
            return Err(closed_error("VecFtgsIterator"));
        }
        Ok(self.records.pop_front())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.records = VecDeque::new();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
