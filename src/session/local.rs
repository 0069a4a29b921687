//! Session over a single shard.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::FtgsParams;
use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{FtgsIterator, VecFtgsIterator};
use crate::ftgs::limit::{TermLimitedIterator, top_terms};
use crate::ftgs::types::{FieldSpec, Term};
use crate::group::{GroupLookup, MultiCache};
use crate::memory::MemoryBudget;
use crate::regroup::{GroupMultiRemapRule, multi_regroup, random_metric_regroup};
use crate::scheduler::YieldCheckpoint;
use crate::session::iterator::ShardFtgsIterator;
use crate::shard::{IntValueLookup, Shard};

/// Documents read per block by group stat aggregation.
const STATS_BLOCK: usize = 8192;

/// Explicit terms to iterate, per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSubset {
    #[serde(default)]
    pub int_terms: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub string_terms: BTreeMap<String, Vec<String>>,
}

impl TermSubset {
    pub fn with_int_terms<S: Into<String>>(mut self, field: S, terms: Vec<i64>) -> Self {
        self.int_terms.insert(field.into(), terms);
        self
    }

    pub fn with_string_terms<S: Into<String>>(mut self, field: S, terms: Vec<String>) -> Self {
        self.string_terms.insert(field.into(), terms);
        self
    }

    /// Int fields first, then string fields, each by name.
    pub fn fields(&self) -> Vec<(FieldSpec, Vec<Term>)> {
        let ints = self
            .int_terms
            .iter()
            .map(|(f, terms)| (FieldSpec::int(f.clone()), terms.iter().map(|&t| Term::Int(t)).collect()));
        let strings = self
            .string_terms
            .iter()
            .map(|(f, terms)| (FieldSpec::string(f.clone()), terms.iter().map(Term::str).collect()));
        ints.chain(strings).collect()
    }
}

/// A rebuilt stat stack waiting to replace a session's current one.
#[derive(Debug)]
pub struct StatChange {
    cache: MultiCache,
    pushed: Option<String>,
}

/// Group assignment and stat stack of one shard.
#[derive(Debug)]
pub struct LocalSession {
    shard: Arc<dyn Shard>,
    cache: MultiCache,
    stat_names: Vec<String>,
}

impl LocalSession {
    /// Open a session with every document in group 1 and no stats.
    pub fn open(shard: Arc<dyn Shard>, budget: &MemoryBudget) -> Result<Self> {
        let cache = MultiCache::build(shard.num_docs(), Vec::new(), None, budget)?;
        debug!("Opened local session on shard {} ({} docs)", shard.name(), shard.num_docs());
        Ok(LocalSession {
            shard,
            cache,
            stat_names: Vec::new(),
        })
    }

    pub fn shard(&self) -> &dyn Shard {
        self.shard.as_ref()
    }

    pub fn name(&self) -> &str {
        self.shard.name()
    }

    pub fn num_docs(&self) -> u32 {
        self.shard.num_docs()
    }

    pub fn num_stats(&self) -> usize {
        self.cache.num_stats()
    }

    /// Names of the active stats, bottom of the stack first.
    pub fn stat_names(&self) -> &[String] {
        &self.stat_names
    }

    pub fn num_groups(&self) -> u32 {
        self.cache.group_lookup().num_groups()
    }

    pub fn group_lookup(&self) -> &GroupLookup {
        self.cache.group_lookup()
    }

    /// Rebuild the cache with the shard metric `name` pushed, without
    /// touching the live stack.
    pub fn prepare_push_stat(&self, name: &str, budget: &MemoryBudget) -> Result<StatChange> {
        let metric = self.shard.metric(name)?;
        Ok(StatChange {
            cache: self.cache.with_pushed(metric, budget)?,
            pushed: Some(name.to_string()),
        })
    }

    /// Rebuild the cache with the top stat popped, without touching the
    /// live stack.
    pub fn prepare_pop_stat(&self, budget: &MemoryBudget) -> Result<StatChange> {
        Ok(StatChange {
            cache: self.cache.with_popped(budget)?,
            pushed: None,
        })
    }

    /// Swap in a prepared stack and return the new depth. The replaced
    /// table's memory goes back to the budget.
    pub fn apply_stat_change(&mut self, change: StatChange) -> usize {
        self.cache = change.cache;
        match change.pushed {
            Some(name) => self.stat_names.push(name),
            None => {
                self.stat_names.pop();
            }
        }
        self.num_stats()
    }

    /// Push the shard metric `name` and return the new stack depth.
    pub fn push_stat(&mut self, name: &str, budget: &MemoryBudget) -> Result<usize> {
        let change = self.prepare_push_stat(name, budget)?;
        Ok(self.apply_stat_change(change))
    }

    /// Pop the top stat and return the new stack depth.
    pub fn pop_stat(&mut self, budget: &MemoryBudget) -> Result<usize> {
        let change = self.prepare_pop_stat(budget)?;
        Ok(self.apply_stat_change(change))
    }

    /// Apply remap rules; see [`multi_regroup`].
    pub fn regroup(
        &mut self,
        rules: &[GroupMultiRemapRule],
        error_on_collision: bool,
        budget: &MemoryBudget,
        checkpoint: &mut YieldCheckpoint,
    ) -> Result<u32> {
        multi_regroup(
            self.shard.as_ref(),
            self.cache.group_lookup_mut(),
            rules,
            error_on_collision,
            budget,
            checkpoint,
        )
    }

    /// Salted split of `target_group` on the shard metric `metric`; see
    /// [`random_metric_regroup`].
    #[allow(clippy::too_many_arguments)]
    pub fn random_metric_regroup(
        &mut self,
        metric: &str,
        salt: &str,
        p: f64,
        target_group: u32,
        negative_group: u32,
        positive_group: u32,
        budget: &MemoryBudget,
        checkpoint: &mut YieldCheckpoint,
    ) -> Result<u32> {
        let values = self.shard.metric(metric)?;
        random_metric_regroup(
            self.cache.group_lookup_mut(),
            values.as_ref(),
            salt,
            p,
            target_group,
            negative_group,
            positive_group,
            budget,
            checkpoint,
        )
    }

    /// Add the sum of stat `stat` per group into `totals`, which is indexed
    /// by group id. Group 0 is skipped.
    pub fn add_group_stats(&self, stat: usize, totals: &mut [i64]) -> Result<()> {
        let metric = self.cache.metric(stat)?;
        let lookup = self.cache.group_lookup();
        if (lookup.num_groups() as usize) > totals.len() {
            return Err(FtgsError::invalid_argument(format!(
                "group stats buffer of {} entries for {} groups",
                totals.len(),
                lookup.num_groups()
            )));
        }

        let num_docs = lookup.size();
        let mut docs = Vec::with_capacity(STATS_BLOCK);
        let mut groups = vec![0u32; STATS_BLOCK];
        let mut values = vec![0i64; STATS_BLOCK];
        for start in (0..num_docs).step_by(STATS_BLOCK) {
            let n = STATS_BLOCK.min(num_docs - start);
            docs.clear();
            docs.extend(start as u32..(start + n) as u32);
            lookup.fill_groups_sequential(start as u32, &mut groups[..n]);
            metric.lookup(&docs, &mut values[..n]);
            for (&group, &value) in groups[..n].iter().zip(&values[..n]) {
                if group != 0 {
                    totals[group as usize] += value;
                }
            }
        }
        Ok(())
    }

    /// FTGS iterator shaped by `params`: term limits and top-terms
    /// selection are applied here.
    pub fn ftgs_iterator(
        &self,
        params: &FtgsParams,
        budget: &MemoryBudget,
        checkpoint: YieldCheckpoint,
    ) -> Result<Box<dyn FtgsIterator + '_>> {
        let mut iterator = ShardFtgsIterator::new(
            self.shard.as_ref(),
            self.cache.group_lookup(),
            params.fields.clone(),
            params.sorted || params.is_top_terms(),
            params.with_stats,
            budget,
        )?
        .with_checkpoint(checkpoint);

        match params.sort_stat {
            Some(stat) if params.term_limit > 0 => {
                let selected: VecFtgsIterator = top_terms(&mut iterator, params.term_limit, stat)?;
                Ok(Box::new(selected))
            }
            _ if params.term_limit > 0 => Ok(Box::new(TermLimitedIterator::new(iterator, params.term_limit))),
            _ => Ok(Box::new(iterator)),
        }
    }

    /// Sorted FTGS iterator over the listed terms only.
    pub fn subset_ftgs_iterator(
        &self,
        subset: &TermSubset,
        budget: &MemoryBudget,
        checkpoint: YieldCheckpoint,
    ) -> Result<ShardFtgsIterator<'_>> {
        Ok(
            ShardFtgsIterator::subset(self.shard.as_ref(), self.cache.group_lookup(), subset.fields(), budget)?
                .with_checkpoint(checkpoint),
        )
    }

    /// Heap bytes held by the session's table.
    pub fn memory_used(&self) -> usize {
        self.cache.memory_used()
    }
}
