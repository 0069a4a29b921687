//! K-way merge of sorted FTGS streams, summing stats of equal terms.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::bittree::BitTree;
use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{BoxedFtgsIterator, FtgsIterator, close_all, closed_error};
use crate::ftgs::types::{FieldSpec, FtgsRecord, GroupStats, Term};

/// Entry for the k-way merge heap.
pub(crate) struct MergeEntry {
    pub(crate) record: FtgsRecord,
    pub(crate) source: usize,
}

impl MergeEntry {
    fn key(&self) -> (usize, &Term, usize) {
        (self.record.field, &self.record.term, self.source)
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default)
        other.key().cmp(&self.key())
    }
}

/// Check that `inputs` can be combined key-wise: same fields, same stat
/// count, all sorted.
pub(crate) fn check_compatible(inputs: &[BoxedFtgsIterator], what: &str) -> Result<()> {
    let Some(first) = inputs.first() else {
        return Err(FtgsError::invalid_argument(format!("{what} needs at least one input")));
    };
    for (i, input) in inputs.iter().enumerate() {
        if !input.is_sorted() {
            return Err(FtgsError::invalid_argument(format!(
                "{what} input {i} is not sorted"
            )));
        }
        if input.fields() != first.fields() || input.num_stats() != first.num_stats() {
            return Err(FtgsError::invalid_argument(format!(
                "{what} input {i} has a different field list or stat count"
            )));
        }
    }
    Ok(())
}

/// Pull the next record of `source` into `heap`.
pub(crate) fn refill(
    heap: &mut BinaryHeap<MergeEntry>,
    inputs: &mut [BoxedFtgsIterator],
    source: usize,
) -> Result<()> {
    if let Some(record) = inputs[source].next_record()? {
        heap.push(MergeEntry { record, source });
    }
    Ok(())
}

/// Merges sorted streams over the same fields into one sorted stream in
/// which every `(field, term)` appears once and the stats of a group are
/// summed over all inputs that carried it.
///
/// Inputs are closed when the merger is closed.
pub struct FtgsMerger {
    inputs: Vec<BoxedFtgsIterator>,
    fields: Arc<[FieldSpec]>,
    num_stats: usize,
    num_groups: u32,
    heap: BinaryHeap<MergeEntry>,
    primed: bool,
    accumulator: Vec<i64>,
    touched: Option<BitTree>,
    group_buffer: Vec<u32>,
    closed: bool,
}

impl FtgsMerger {
    /// Create a merger over `inputs`. Incompatible inputs are closed and
    /// rejected with [`FtgsError::InvalidArgument`].
    pub fn new(mut inputs: Vec<BoxedFtgsIterator>) -> Result<Self> {
        if let Err(e) = check_compatible(&inputs, "merger") {
            close_all(&mut inputs);
            return Err(e);
        }
        let fields: Arc<[FieldSpec]> = inputs[0].fields().into();
        let num_stats = inputs[0].num_stats();
        let num_groups = inputs.iter().map(|i| i.num_groups()).max().unwrap_or(0);
        let heap = BinaryHeap::with_capacity(inputs.len());

        Ok(FtgsMerger {
            inputs,
            fields,
            num_stats,
            num_groups,
            heap,
            primed: false,
            accumulator: Vec::new(),
            touched: None,
            group_buffer: Vec::new(),
            closed: false,
        })
    }

    fn prime(&mut self) -> Result<()> {
        for source in 0..self.inputs.len() {
            refill(&mut self.heap, &mut self.inputs, source)?;
        }
        self.primed = true;
        Ok(())
    }

    fn sum(&mut self, first: FtgsRecord, mut rest: Vec<FtgsRecord>) -> Result<FtgsRecord> {
        let num_stats = self.num_stats;
        let num_groups = self.num_groups as usize;
        if self.touched.is_none() {
            self.touched = Some(BitTree::new(num_groups));
            self.accumulator = vec![0; num_groups * num_stats];
            self.group_buffer = vec![0; num_groups];
        }
        let Some(touched) = self.touched.as_mut() else {
            return Err(FtgsError::illegal_state("merge accumulator missing"));
        };

        rest.push(first);
        for record in &rest {
            for (group, stats) in record.groups.iter() {
                touched.set(group)?;
                let base = group as usize * num_stats;
                for (acc, &value) in self.accumulator[base..base + num_stats].iter_mut().zip(stats) {
                    *acc += value;
                }
            }
        }

        let count = touched.dump(&mut self.group_buffer);
        let mut groups = GroupStats::with_capacity(num_stats, count);
        for &group in &self.group_buffer[..count] {
            let base = group as usize * num_stats;
            let slot = &mut self.accumulator[base..base + num_stats];
            groups.push(group, slot);
            slot.fill(0);
        }

        let Some(record) = rest.pop() else {
            return Err(FtgsError::illegal_state("merge produced no record"));
        };
        Ok(FtgsRecord::new(record.field, record.term, groups))
    }
}

impl FtgsIterator for FtgsMerger {
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
            return Err(closed_error("FtgsMerger"));
        }
        if !self.primed {
            self.prime()?;
        }

        let Some(head) = self.heap.pop() else {
            return Ok(None);
        };
        refill(&mut self.heap, &mut self.inputs, head.source)?;

        let mut same = Vec::new();
        while let Some(next) = self.heap.peek() {
            if next.record.field != head.record.field || next.record.term != head.record.term {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                refill(&mut self.heap, &mut self.inputs, entry.source)?;
                same.push(entry.record);
            }
        }

        if same.is_empty() {
            return Ok(Some(head.record));
        }
        self.sum(head.record, same).map(Some)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            close_all(&mut self.inputs);
            self.heap.clear();
            self.accumulator = Vec::new();
            self.touched = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for FtgsMerger {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::iterator::{VecFtgsIterator, drain};

    fn record(term: &str, groups: &[(u32, i64)]) -> FtgsRecord {
        let mut gs = GroupStats::new(1);
        for &(g, v) in groups {
            gs.push(g, &[v]);
        }
        FtgsRecord::new(0, Term::str(term), gs)
    }

    fn input(records: Vec<FtgsRecord>) -> BoxedFtgsIterator {
        Box::new(VecFtgsIterator::new(
            vec![FieldSpec::string("q")],
            1,
            5,
            true,
            records,
        ))
    }

    #[test]
    fn test_merge_sums_equal_terms() {
        let a = input(vec![record("abc", &[(3, 5)]), record("xyz", &[(1, 1)])]);
        let b = input(vec![record("abc", &[(1, 2), (3, 7)]), record("def", &[(2, 4)])]);

        let mut merger = FtgsMerger::new(vec![a, b]).unwrap();
        let merged = drain(&mut merger).unwrap();

        assert_eq!(
            merged,
            vec![
                record("abc", &[(1, 2), (3, 12)]),
                record("def", &[(2, 4)]),
                record("xyz", &[(1, 1)]),
            ]
        );
    }

    #[test]
    fn test_merge_respects_field_order() {
        let fields = vec![FieldSpec::int("a"), FieldSpec::int("b")];
        let mk = |field, term, v| {
            let mut gs = GroupStats::new(1);
            gs.push(1, &[v]);
            FtgsRecord::new(field, Term::Int(term), gs)
        };
        let a: BoxedFtgsIterator = Box::new(VecFtgsIterator::new(
            fields.clone(),
            1,
            2,
            true,
            vec![mk(0, 9, 1), mk(1, 1, 1)],
        ));
        let b: BoxedFtgsIterator = Box::new(VecFtgsIterator::new(
            fields,
            1,
            2,
            true,
            vec![mk(0, 2, 1), mk(1, 1, 2)],
        ));

        let merged = drain(&mut FtgsMerger::new(vec![a, b]).unwrap()).unwrap();
        assert_eq!(merged, vec![mk(0, 2, 1), mk(0, 9, 1), mk(1, 1, 3)]);
    }

    #[test]
    fn test_unsorted_input_rejected_and_closed() {
        let sorted = input(vec![]);
        let unsorted: BoxedFtgsIterator = Box::new(VecFtgsIterator::new(
            vec![FieldSpec::string("q")],
            1,
            5,
            false,
            vec![],
        ));
        let err = FtgsMerger::new(vec![sorted, unsorted]).err().unwrap();
        assert!(matches!(err, FtgsError::InvalidArgument(_)));
    }

    #[test]
    fn test_close_closes_inputs() {
        let mut merger = FtgsMerger::new(vec![input(vec![record("a", &[(1, 1)])])]).unwrap();
        merger.close();
        assert!(merger.inputs.iter().all(|i| i.is_closed()));
        assert!(matches!(merger.next_record(), Err(FtgsError::IllegalState(_))));
    }
}
