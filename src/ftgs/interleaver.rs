//! Recombining the buckets of a split stream.
//!
//! Buckets hold disjoint terms, so interleaving never sums; it only decides
//! the order in which records come out.

use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{BoxedFtgsIterator, FtgsIterator, close_all, closed_error};
use crate::ftgs::merger::{MergeEntry, check_compatible, refill};
use crate::ftgs::types::{FieldSpec, FtgsRecord};

/// Heap-based interleaving of sorted buckets into one sorted stream.
pub struct SortedInterleaver {
    inputs: Vec<BoxedFtgsIterator>,
    fields: Arc<[FieldSpec]>,
    num_stats: usize,
    num_groups: u32,
    heap: BinaryHeap<MergeEntry>,
    primed: bool,
    closed: bool,
}

impl SortedInterleaver {
    pub fn new(mut inputs: Vec<BoxedFtgsIterator>) -> Result<Self> {
        if let Err(e) = check_compatible(&inputs, "sorted interleaver") {
            close_all(&mut inputs);
            return Err(e);
        }
        let fields: Arc<[FieldSpec]> = inputs[0].fields().into();
        let num_stats = inputs[0].num_stats();
        let num_groups = inputs.iter().map(|i| i.num_groups()).max().unwrap_or(0);
        Ok(SortedInterleaver {
            heap: BinaryHeap::with_capacity(inputs.len()),
            inputs,
            fields,
            num_stats,
            num_groups,
            primed: false,
            closed: false,
        })
    }
}

impl FtgsIterator for SortedInterleaver {
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
        true
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        if self.closed {
            return Err(closed_error("SortedInterleaver"));
        }
        if !self.primed {
            for source in 0..self.inputs.len() {
                refill(&mut self.heap, &mut self.inputs, source)?;
            }
            self.primed = true;
        }

        match self.heap.pop() {
            Some(entry) => {
                refill(&mut self.heap, &mut self.inputs, entry.source)?;
                Ok(Some(entry.record))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            close_all(&mut self.inputs);
            self.heap.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SortedInterleaver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Field-major interleaving with no term order: every record of field `f`
/// from every input comes out before any record of field `f + 1`.
pub struct UnsortedInterleaver {
    inputs: Vec<BoxedFtgsIterator>,
    fields: Arc<[FieldSpec]>,
    num_stats: usize,
    num_groups: u32,
    /// One record read ahead per input.
    peeked: Vec<Option<FtgsRecord>>,
    exhausted: Vec<bool>,
    field: usize,
    source: usize,
    closed: bool,
}

impl UnsortedInterleaver {
    pub fn new(mut inputs: Vec<BoxedFtgsIterator>) -> Result<Self> {
        let compatible = match inputs.first() {
            None => Err(FtgsError::invalid_argument(
                "unsorted interleaver needs at least one input",
            )),
            Some(first) => {
                let fields = first.fields();
                let num_stats = first.num_stats();
                if inputs
                    .iter()
                    .all(|i| i.fields() == fields && i.num_stats() == num_stats)
                {
                    Ok(())
                } else {
                    Err(FtgsError::invalid_argument(
                        "unsorted interleaver inputs have different fields or stat counts",
                    ))
                }
            }
        };
        if let Err(e) = compatible {
            close_all(&mut inputs);
            return Err(e);
        }

        let fields: Arc<[FieldSpec]> = inputs[0].fields().into();
        let num_stats = inputs[0].num_stats();
        let num_groups = inputs.iter().map(|i| i.num_groups()).max().unwrap_or(0);
        let n = inputs.len();
        Ok(UnsortedInterleaver {
            inputs,
            fields,
            num_stats,
            num_groups,
            peeked: (0..n).map(|_| None).collect(),
            exhausted: vec![false; n],
            field: 0,
            source: 0,
            closed: false,
        })
    }

    /// The record `source` would produce next, reading ahead if needed.
    fn peek(&mut self, source: usize) -> Result<Option<&FtgsRecord>> {
        if self.peeked[source].is_none() && !self.exhausted[source] {
            match self.inputs[source].next_record()? {
                Some(record) => self.peeked[source] = Some(record),
                None => self.exhausted[source] = true,
            }
        }
        Ok(self.peeked[source].as_ref())
    }
}

impl FtgsIterator for UnsortedInterleaver {
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
        false
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        if self.closed {
            return Err(closed_error("UnsortedInterleaver"));
        }

        while self.field < self.fields.len() {
            while self.source < self.inputs.len() {
                let field = self.field;
                let source = self.source;
                if matches!(self.peek(source)?, Some(record) if record.field == field) {
                    return Ok(self.peeked[source].take());
                }
                self.source += 1;
            }
            self.field += 1;
            self.source = 0;
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            close_all(&mut self.inputs);
            self.peeked.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for UnsortedInterleaver {
    fn drop(&mut self) {
        self.close();
    }
}
