//! Term limits: first-N by arrival and top-K by a stat.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;

use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{FtgsIterator, VecFtgsIterator, closed_error, drain};
use crate::ftgs::types::{FieldSpec, FtgsRecord, Term};

/// Passes at most `limit` records per field, in arrival order. A limit of
/// zero lets everything through.
pub struct TermLimitedIterator<I: FtgsIterator> {
    inner: I,
    limit: usize,
    field: Option<usize>,
    emitted: usize,
}

impl<I: FtgsIterator> TermLimitedIterator<I> {
    pub fn new(inner: I, limit: usize) -> Self {
        TermLimitedIterator {
            inner,
            limit,
            field: None,
            emitted: 0,
        }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I: FtgsIterator> FtgsIterator for TermLimitedIterator<I> {
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
        if self.inner.is_closed() {
            return Err(closed_error("TermLimitedIterator"));
        }
        while let Some(record) = self.inner.next_record()? {
            if self.field != Some(record.field) {
                self.field = Some(record.field);
                self.emitted = 0;
            }
            if self.limit == 0 || self.emitted < self.limit {
                self.emitted += 1;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Keep, for every `(field, group)`, the `limit` terms with the largest
/// `stats[sort_stat]`; ties go to the smaller term.
///
/// Within each field the surviving terms come out ordered by their best
/// selected value, descending, then by term. Each surviving record only
/// carries the groups for which it was selected. The result is marked
/// unsorted. A limit of zero returns the input unchanged. The input is
/// consumed and closed.
pub fn top_terms<I: FtgsIterator + ?Sized>(
    iterator: &mut I,
    limit: usize,
    sort_stat: usize,
) -> Result<VecFtgsIterator> {
    let fields: Vec<FieldSpec> = iterator.fields().to_vec();
    let num_stats = iterator.num_stats();
    let num_groups = iterator.num_groups();
    let sorted = iterator.is_sorted();

    if limit > 0 && sort_stat >= num_stats {
        iterator.close();
        return Err(FtgsError::invalid_argument(format!(
            "sort stat {sort_stat} out of range for {num_stats} stats"
        )));
    }

    let records = drain(iterator)?;
    if limit == 0 {
        return Ok(VecFtgsIterator::new(fields, num_stats, num_groups, sorted, records));
    }

    let mut by_field: Vec<Vec<FtgsRecord>> = (0..fields.len()).map(|_| Vec::new()).collect();
    for record in records {
        let field = record.field;
        by_field
            .get_mut(field)
            .ok_or_else(|| FtgsError::illegal_state(format!("record field {field} out of range")))?
            .push(record);
    }

    let mut output = Vec::new();
    for records in by_field {
        output.extend(select_field(records, limit, sort_stat));
    }
    Ok(VecFtgsIterator::new(fields, num_stats, num_groups, false, output))
}

fn select_field(records: Vec<FtgsRecord>, limit: usize, sort_stat: usize) -> Vec<FtgsRecord> {
    // min-heap per group: the root is the weakest kept candidate
    let mut heaps: AHashMap<u32, BinaryHeap<Reverse<(i64, Reverse<&Term>, usize)>>> =
        AHashMap::new();
    for (index, record) in records.iter().enumerate() {
        for (group, stats) in record.groups.iter() {
            let candidate = Reverse((stats[sort_stat], Reverse(&record.term), index));
            let heap = heaps.entry(group).or_default();
            if heap.len() < limit {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|weakest| candidate < *weakest) {
                heap.pop();
                heap.push(candidate);
            }
        }
    }

    let mut keep: Vec<Vec<u32>> = vec![Vec::new(); records.len()];
    for (group, heap) in heaps {
        for Reverse((_, _, index)) in heap {
            keep[index].push(group);
        }
    }

    let mut selected: Vec<(i64, FtgsRecord)> = records
        .into_iter()
        .zip(keep)
        .filter(|(_, groups)| !groups.is_empty())
        .map(|(mut record, mut groups)| {
            groups.sort_unstable();
            record.groups.retain(|g, _| groups.binary_search(&g).is_ok());
            let best = record
                .groups
                .iter()
                .map(|(_, stats)| stats[sort_stat])
                .max()
                .unwrap_or(i64::MIN);
            (best, record)
        })
        .collect();

    selected.sort_by(|(a, ra), (b, rb)| b.cmp(a).then_with(|| ra.term.cmp(&rb.term)));
    selected.into_iter().map(|(_, record)| record).collect()
}
