//! Owner of a shard's packed group/stat table.

use std::sync::Arc;

use log::debug;

use crate::error::{FtgsError, Result};
use crate::group::lookup::GroupLookup;
use crate::group::packed::PackedTable;
use crate::memory::{MemoryBudget, MemoryClaim};
use crate::shard::IntValueLookup;

/// Documents copied per metric lookup while filling the table.
const BLOCK_COPY_SIZE: usize = 8192;

/// Packs the group assignment and the values of the active stat stack of one
/// shard into a single [`PackedTable`], claimed against the session budget.
///
/// The table is rebuilt whenever the stat stack changes; the group
/// assignment carries over. A failed rebuild leaves the cache untouched.
#[derive(Debug)]
pub struct MultiCache {
    lookup: GroupLookup,
    metrics: Vec<Arc<dyn IntValueLookup>>,
    _claim: MemoryClaim,
}

impl MultiCache {
    /// Build a cache over `metrics`. Groups are copied from `previous` when
    /// given; otherwise every document starts in group 1.
    pub fn build(
        num_docs: u32,
        metrics: Vec<Arc<dyn IntValueLookup>>,
        previous: Option<&GroupLookup>,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let ranges: Vec<(i64, i64)> = metrics.iter().map(|m| (m.min(), m.max())).collect();
        let claim = budget.claim(PackedTable::size_for(num_docs as usize, &ranges))?;
        let mut table = PackedTable::new(num_docs as usize, &ranges)?;

        let mut docs = Vec::with_capacity(BLOCK_COPY_SIZE);
        let mut values = vec![0i64; BLOCK_COPY_SIZE];
        for start in (0..num_docs).step_by(BLOCK_COPY_SIZE) {
            let end = (start as usize + BLOCK_COPY_SIZE).min(num_docs as usize) as u32;
            docs.clear();
            docs.extend(start..end);
            let n = docs.len();
            for (stat, metric) in metrics.iter().enumerate() {
                metric.lookup(&docs, &mut values[..n]);
                for (i, &value) in values[..n].iter().enumerate() {
                    table.set_stat(start as usize + i, stat, value);
                }
            }
        }

        let mut lookup = GroupLookup::new(table, 1);
        if let Some(previous) = previous {
            previous.copy_into(&mut lookup)?;
        }
        debug!(
            "Built multi cache: {num_docs} docs, {} stats, {} bytes",
            metrics.len(),
            claim.amount()
        );

        Ok(MultiCache {
            lookup,
            metrics,
            _claim: claim,
        })
    }

    pub fn group_lookup(&self) -> &GroupLookup {
        &self.lookup
    }

    pub fn group_lookup_mut(&mut self) -> &mut GroupLookup {
        &mut self.lookup
    }

    pub fn num_stats(&self) -> usize {
        self.metrics.len()
    }

    /// Cached values of stat `stat`.
    pub fn metric(&self, stat: usize) -> Result<CachedMetric<'_>> {
        if stat >= self.metrics.len() {
            return Err(FtgsError::invalid_argument(format!(
                "stat {stat} out of range for {} stats",
                self.metrics.len()
            )));
        }
        Ok(CachedMetric {
            lookup: &self.lookup,
            stat,
        })
    }

    /// A rebuilt cache with `metric` on top of the stat stack. `self` is
    /// left as is until the caller swaps the result in.
    pub fn with_pushed(&self, metric: Arc<dyn IntValueLookup>, budget: &MemoryBudget) -> Result<Self> {
        let mut metrics = self.metrics.clone();
        metrics.push(metric);
        Self::build(self.lookup.size() as u32, metrics, Some(&self.lookup), budget)
    }

    /// A rebuilt cache without the top of the stat stack.
    pub fn with_popped(&self, budget: &MemoryBudget) -> Result<Self> {
        let mut metrics = self.metrics.clone();
        if metrics.pop().is_none() {
            return Err(FtgsError::illegal_state("pop_stat on an empty stat stack"));
        }
        Self::build(self.lookup.size() as u32, metrics, Some(&self.lookup), budget)
    }

    /// Add `metric` on top of the stat stack.
    pub fn push_stat(&mut self, metric: Arc<dyn IntValueLookup>, budget: &MemoryBudget) -> Result<()> {
        *self = self.with_pushed(metric, budget)?;
        Ok(())
    }

    /// Remove the top of the stat stack.
    pub fn pop_stat(&mut self, budget: &MemoryBudget) -> Result<()> {
        *self = self.with_popped(budget)?;
        Ok(())
    }

    /// Heap bytes held by the table.
    pub fn memory_used(&self) -> usize {
        self.lookup.memory_used()
    }
}

/// Read access to one stat column of a [`MultiCache`].
#[derive(Debug, Clone, Copy)]
pub struct CachedMetric<'a> {
    lookup: &'a GroupLookup,
    stat: usize,
}

impl IntValueLookup for CachedMetric<'_> {
    fn min(&self) -> i64 {
        self.lookup.stat_range(self.stat).0
    }

    fn max(&self) -> i64 {
        self.lookup.stat_range(self.stat).1
    }

    fn lookup(&self, docs: &[u32], values: &mut [i64]) {
        self.lookup.lookup_stat(self.stat, docs, values);
    }

    fn memory_used(&self) -> usize {
        0
    }
}
