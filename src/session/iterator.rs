//! Lazy FTGS accumulation over one shard.

use std::sync::Arc;

use crate::bittree::BitTree;
use crate::error::Result;
use crate::ftgs::iterator::{FtgsIterator, closed_error};
use crate::ftgs::types::{FieldSpec, FtgsRecord, GroupStats, Term};
use crate::group::GroupLookup;
use crate::memory::{MemoryBudget, MemoryClaim};
use crate::scheduler::YieldCheckpoint;
use crate::shard::{Shard, TermCursor, open_terms};

/// Documents resolved per group/stat lookup.
const DOC_BLOCK: usize = 4096;

/// Per-term accumulation state: a dense `num_groups x num_stats` sum
/// table and the tree of groups touched by the current term.
struct Accumulator {
    num_stats: usize,
    sums: Vec<i64>,
    touched: BitTree,
    dumped: Vec<u32>,
    groups: Vec<u32>,
    values: Vec<i64>,
}

impl Accumulator {
    fn new(num_groups: u32, num_stats: usize) -> Self {
        Accumulator {
            num_stats,
            sums: vec![0; num_groups as usize * num_stats],
            touched: BitTree::new(num_groups as usize),
            dumped: vec![0; num_groups as usize],
            groups: vec![0; DOC_BLOCK],
            values: vec![0; DOC_BLOCK],
        }
    }

    /// Drop the buffers, keeping the stat count.
    fn release(&mut self) {
        self.sums = Vec::new();
        self.touched = BitTree::new(0);
        self.dumped = Vec::new();
        self.groups = Vec::new();
        self.values = Vec::new();
    }

    fn bytes(num_groups: u32, num_stats: usize) -> u64 {
        let groups = num_groups as u64;
        groups * num_stats as u64 * 8 + groups * 4 + groups / 8 + DOC_BLOCK as u64 * 12
    }

    /// Sum the stats of `docs` per group. Documents in group 0 are skipped.
    fn accumulate(
        &mut self,
        lookup: &GroupLookup,
        docs: &[u32],
        checkpoint: &mut YieldCheckpoint,
    ) -> Result<GroupStats> {
        for chunk in docs.chunks(DOC_BLOCK) {
            let groups = &mut self.groups[..chunk.len()];
            lookup.fill_groups_for_docs(chunk, groups);
            for &group in groups.iter() {
                if group != 0 {
                    self.touched.set(group)?;
                }
            }
            for stat in 0..self.num_stats {
                let values = &mut self.values[..chunk.len()];
                lookup.lookup_stat(stat, chunk, values);
                for (&group, &value) in groups.iter().zip(values.iter()) {
                    if group != 0 {
                        self.sums[group as usize * self.num_stats + stat] += value;
                    }
                }
            }
            checkpoint.tick(chunk.len() as u64);
        }

        let count = self.touched.dump(&mut self.dumped);
        let mut stats = GroupStats::with_capacity(self.num_stats, count);
        for &group in &self.dumped[..count] {
            let row = group as usize * self.num_stats;
            let sums = &mut self.sums[row..row + self.num_stats];
            stats.push(group, sums);
            sums.fill(0);
        }
        Ok(stats)
    }
}

/// Where the terms of one field come from.
enum TermSource {
    /// Every term of the cursor.
    All,
    /// Only these terms, ascending.
    Subset { terms: Vec<Term>, next: usize },
}

/// FTGS iterator over the current group assignment of one shard.
///
/// Records are produced one term at a time; terms whose documents all sit
/// in group 0 produce no record. Fields the shard lacks produce nothing.
pub struct ShardFtgsIterator<'a> {
    shard: &'a dyn Shard,
    lookup: &'a GroupLookup,
    fields: Arc<[FieldSpec]>,
    sources: Vec<TermSource>,
    sorted: bool,
    field: usize,
    cursor: Option<Box<dyn TermCursor>>,
    accumulator: Accumulator,
    checkpoint: YieldCheckpoint,
    claim: Option<MemoryClaim>,
    closed: bool,
}

impl<'a> ShardFtgsIterator<'a> {
    /// Iterate every term of `fields`. With `with_stats` off, records carry
    /// no stats.
    pub fn new(
        shard: &'a dyn Shard,
        lookup: &'a GroupLookup,
        fields: Vec<FieldSpec>,
        sorted: bool,
        with_stats: bool,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let sources = fields.iter().map(|_| TermSource::All).collect();
        Self::build(shard, lookup, fields, sources, sorted, with_stats, budget)
    }

    /// Iterate only the listed terms of each field; output is sorted.
    pub fn subset(
        shard: &'a dyn Shard,
        lookup: &'a GroupLookup,
        fields: Vec<(FieldSpec, Vec<Term>)>,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let (specs, sources) = fields
            .into_iter()
            .map(|(spec, mut terms)| {
                terms.sort();
                terms.dedup();
                (spec, TermSource::Subset { terms, next: 0 })
            })
            .unzip();
        Self::build(shard, lookup, specs, sources, true, true, budget)
    }

    fn build(
        shard: &'a dyn Shard,
        lookup: &'a GroupLookup,
        fields: Vec<FieldSpec>,
        sources: Vec<TermSource>,
        sorted: bool,
        with_stats: bool,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let num_stats = if with_stats { lookup.num_stats() } else { 0 };
        let num_groups = lookup.num_groups();
        let claim = budget.claim(Accumulator::bytes(num_groups, num_stats))?;
        Ok(ShardFtgsIterator {
            shard,
            lookup,
            fields: fields.into(),
            sources,
            sorted,
            field: 0,
            cursor: None,
            accumulator: Accumulator::new(num_groups, num_stats),
            checkpoint: YieldCheckpoint::disabled(),
            claim: Some(claim),
            closed: false,
        })
    }

    /// Poll `checkpoint` while accumulating.
    pub fn with_checkpoint(mut self, checkpoint: YieldCheckpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Move the cursor to the next term of the current field.
    fn advance(&mut self) -> Result<bool> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(false);
        };
        match &mut self.sources[self.field] {
            TermSource::All => cursor.next(),
            TermSource::Subset { terms, next } => {
                while *next < terms.len() {
                    let term = &terms[*next];
                    *next += 1;
                    cursor.reset(term);
                    if cursor.next()? && cursor.term() == Some(term) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

impl FtgsIterator for ShardFtgsIterator<'_> {
    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn num_stats(&self) -> usize {
        self.accumulator.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.lookup.num_groups()
    }

    fn is_sorted(&self) -> bool {
        self.sorted
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        if self.closed {
            return Err(closed_error("shard FTGS iterator"));
        }
        loop {
            if self.field >= self.fields.len() {
                return Ok(None);
            }
            if self.cursor.is_none() {
                let subset = matches!(self.sources[self.field], TermSource::Subset { .. });
                let cursor = open_terms(self.shard, &self.fields[self.field], self.sorted || subset)?;
                self.cursor = Some(cursor);
            }
            if !self.advance()? {
                self.cursor = None;
                self.field += 1;
                continue;
            }

            let Some(cursor) = self.cursor.as_ref() else {
                continue;
            };
            let Some(term) = cursor.term().cloned() else {
                continue;
            };
            let groups = self
                .accumulator
                .accumulate(self.lookup, cursor.docs(), &mut self.checkpoint)?;
            if !groups.is_empty() {
                return Ok(Some(FtgsRecord::new(self.field, term, groups)));
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.cursor = None;
        self.accumulator.release();
        self.claim.take();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::drain;
    use crate::group::MultiCache;
    use crate::shard::MemoryShard;

    fn shard() -> MemoryShard {
        MemoryShard::builder("s", 6)
            .int_column("x", vec![1, 2, 1, 3, 2, 1])
            .string_column("c", ["b", "a", "b", "a", "c", "a"])
            .int_column("v", vec![10, 20, 30, 40, 50, 60])
            .build()
            .unwrap()
    }

    fn cache(shard: &MemoryShard) -> MultiCache {
        let budget = MemoryBudget::unlimited();
        let mut cache = MultiCache::build(6, Vec::new(), None, &budget).unwrap();
        cache.push_stat(shard.metric("v").unwrap(), &budget).unwrap();
        cache.push_stat(shard.metric("count()").unwrap(), &budget).unwrap();
        cache
            .group_lookup_mut()
            .batch_set(&[0, 1, 2, 3, 4, 5], &[1, 2, 1, 0, 2, 2]);
        cache
    }

    #[test]
    fn test_sums_per_group() {
        let shard = shard();
        let cache = cache(&shard);
        let mut it = ShardFtgsIterator::new(
            &shard,
            cache.group_lookup(),
            vec![FieldSpec::int("x"), FieldSpec::string("c")],
            true,
            true,
            &MemoryBudget::unlimited(),
        )
        .unwrap();
        assert_eq!(it.num_groups(), 3);
        let records = drain(&mut it).unwrap();

        // x=3 only has doc 3, which is in group 0
        let terms: Vec<(usize, Term)> = records.iter().map(|r| (r.field, r.term.clone())).collect();
        assert_eq!(
            terms,
            vec![
                (0, Term::Int(1)),
                (0, Term::Int(2)),
                (1, Term::str("a")),
                (1, Term::str("b")),
                (1, Term::str("c")),
            ]
        );
        let x1 = &records[0].groups;
        assert_eq!(x1.groups(), &[1, 2]);
        assert_eq!(x1.get(1), Some(&[40, 2][..]));
        assert_eq!(x1.get(2), Some(&[60, 1][..]));
        assert_eq!(records[2].groups.get(2), Some(&[80, 2][..]));
        assert!(it.next_record().is_err());
    }

    #[test]
    fn test_subset_and_no_stats() {
        let shard = shard();
        let cache = cache(&shard);
        let mut it = ShardFtgsIterator::subset(
            &shard,
            cache.group_lookup(),
            vec![
                (FieldSpec::int("x"), vec![Term::Int(2), Term::Int(7), Term::Int(1)]),
                (FieldSpec::string("missing"), vec![Term::str("a")]),
            ],
            &MemoryBudget::unlimited(),
        )
        .unwrap();
        let records = drain(&mut it).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].term, Term::Int(1));
        assert_eq!(records[1].term, Term::Int(2));

        let mut it = ShardFtgsIterator::new(
            &shard,
            cache.group_lookup(),
            vec![FieldSpec::string("c")],
            true,
            false,
            &MemoryBudget::unlimited(),
        )
        .unwrap();
        assert_eq!(it.num_stats(), 0);
        let records = drain(&mut it).unwrap();
        assert_eq!(records[0].groups.get(2), Some(&[][..]));
    }

    #[test]
    fn test_numeric_view_of_string_field() {
        let shard = MemoryShard::builder("s", 4)
            .string_column("n", ["10", "9", "x", "10"])
            .build()
            .unwrap();
        let budget = MemoryBudget::unlimited();
        let cache = MultiCache::build(4, vec![shard.metric("count()").unwrap()], None, &budget).unwrap();
        let mut it = ShardFtgsIterator::new(
            &shard,
            cache.group_lookup(),
            vec![FieldSpec::int("n")],
            true,
            true,
            &budget,
        )
        .unwrap();
        let records = drain(&mut it).unwrap();
        let terms: Vec<Term> = records.iter().map(|r| r.term.clone()).collect();
        assert_eq!(terms, vec![Term::Int(9), Term::Int(10)]);
        assert_eq!(records[1].groups.get(1), Some(&[2][..]));
    }

    #[test]
    fn test_claims_accumulator_memory() {
        let shard = shard();
        let cache = cache(&shard);
        let budget = MemoryBudget::new(16);
        let result = ShardFtgsIterator::new(
            &shard,
            cache.group_lookup(),
            vec![FieldSpec::int("x")],
            true,
            true,
            &budget,
        );
        assert!(matches!(result, Err(e) if e.is_out_of_memory()));
    }

    #[test]
    fn test_close_releases_accumulator_memory() {
        let shard = shard();
        let cache = cache(&shard);
        let budget = MemoryBudget::unlimited();
        let mut it = ShardFtgsIterator::new(
            &shard,
            cache.group_lookup(),
            vec![FieldSpec::int("x")],
            true,
            true,
            &budget,
        )
        .unwrap();
        assert!(budget.used() > 0);
        it.close();
        assert_eq!(budget.used(), 0);
        assert!(it.is_closed());
        assert!(it.next_record().is_err());
    }
}
