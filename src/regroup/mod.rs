//! Regroup engine.
//!
//! Deterministic regrouping evaluates [`GroupMultiRemapRule`]s against the
//! term cursors of a shard. Every condition gets a global priority (rule
//! order, then condition order); a document keeps the best priority it
//! matched, so the first matching condition wins. Groups are rewritten only
//! once every condition has been evaluated: a collision leaves the lookup
//! untouched.
//!
//! Documents whose group has no rule move to group 0.

pub mod random;
pub mod rules;

use std::collections::BTreeMap;

use ahash::AHashMap;
use bit_vec::BitVec;
use log::debug;

use crate::error::Result;
use crate::ftgs::types::{FieldSpec, Term};
use crate::group::{ConditionMatch, GroupLookup, UNMATCHED};
use crate::memory::MemoryBudget;
use crate::scheduler::YieldCheckpoint;
use crate::shard::{Shard, TermCursor, open_terms};

pub use random::{SALT_SEED, random_metric_regroup, salted_fraction};
pub use rules::{
    GroupMultiRemapRule, GroupRemapRule, RegroupCondition, merge_single_rules, validate_rules,
};

/// Documents rewritten per `batch_set` call.
const FINALIZE_BLOCK: usize = 8192;

/// Conditions reading one field.
#[derive(Debug, Default)]
struct FieldPlan {
    equal: BTreeMap<Term, Vec<ConditionMatch>>,
    /// `(bound, condition)`: matches every term `<= bound`.
    at_most: Vec<(Term, ConditionMatch)>,
}

impl FieldPlan {
    /// Conditions satisfied by `term`, by ascending priority.
    fn matching(&self, term: &Term) -> Vec<ConditionMatch> {
        let mut out: Vec<ConditionMatch> = self.equal.get(term).cloned().unwrap_or_default();
        out.extend(
            self.at_most
                .iter()
                .filter(|(bound, _)| term <= bound)
                .map(|(_, c)| *c),
        );
        out.sort_by_key(|c| c.priority);
        out
    }

    /// Largest term any condition can match.
    fn upper_bound(&self) -> Option<&Term> {
        let eq = self.equal.keys().next_back();
        let ineq = self.at_most.iter().map(|(b, _)| b).max();
        eq.max(ineq)
    }
}

/// Plans grouped by field, in first-seen order.
fn plan(rules: &[GroupMultiRemapRule]) -> (Vec<(FieldSpec, FieldPlan)>, Vec<u32>) {
    let mut plans: Vec<(FieldSpec, FieldPlan)> = Vec::new();
    let mut positive_of = Vec::new();
    for rule in rules {
        for (condition, &positive) in rule.conditions.iter().zip(&rule.positive_groups) {
            let matched = ConditionMatch {
                target_group: rule.target_group,
                priority: positive_of.len() as u32,
            };
            positive_of.push(positive);

            let spec = condition.field_spec();
            let index = match plans.iter().position(|(s, _)| *s == spec) {
                Some(i) => i,
                None => {
                    plans.push((spec, FieldPlan::default()));
                    plans.len() - 1
                }
            };
            let field_plan = &mut plans[index].1;
            if condition.inequality {
                field_plan.at_most.push((condition.term(), matched));
            } else {
                field_plan
                    .equal
                    .entry(condition.term())
                    .or_default()
                    .push(matched);
            }
        }
    }
    (plans, positive_of)
}

struct MatchState<'a> {
    lookup: &'a GroupLookup,
    remapped: BitVec,
    ranks: Vec<u32>,
    error_on_collision: bool,
}

impl MatchState<'_> {
    fn apply(&mut self, field: &str, cursor: &dyn TermCursor, conditions: &[ConditionMatch]) -> Result<()> {
        let Some(term) = cursor.term() else {
            return Ok(());
        };
        match term {
            Term::Int(value) => self.lookup.apply_int_conditions(
                cursor.docs(),
                &mut self.remapped,
                &mut self.ranks,
                conditions,
                self.error_on_collision,
                field,
                *value,
            ),
            Term::Str(bytes) => self.lookup.apply_string_conditions(
                cursor.docs(),
                &mut self.remapped,
                &mut self.ranks,
                conditions,
                self.error_on_collision,
                field,
                bytes,
            ),
        }
    }
}

/// Apply `rules` to the documents of `shard` and return the new number of
/// groups.
///
/// Rules are validated first: target group 0 and two rules on the same
/// target are rejected. With `error_on_collision`, a document matched by
/// two different conditions fails the call with
/// [`FtgsError::RuleCollision`](crate::error::FtgsError::RuleCollision)
/// and groups are left as they were.
pub fn multi_regroup(
    shard: &dyn Shard,
    lookup: &mut GroupLookup,
    rules: &[GroupMultiRemapRule],
    error_on_collision: bool,
    budget: &MemoryBudget,
    checkpoint: &mut YieldCheckpoint,
) -> Result<u32> {
    validate_rules(rules)?;
    let num_docs = lookup.size();
    let _claim = budget.claim(num_docs as u64 * 4 + num_docs.div_ceil(8) as u64)?;

    let (plans, positive_of) = plan(rules);
    let mut state = MatchState {
        lookup: &*lookup,
        remapped: BitVec::from_elem(num_docs, false),
        ranks: vec![UNMATCHED; num_docs],
        error_on_collision,
    };

    for (spec, field_plan) in &plans {
        let mut cursor = open_terms(shard, spec, true)?;
        if field_plan.at_most.is_empty() {
            for (term, conditions) in &field_plan.equal {
                cursor.reset(term);
                if cursor.next()? && cursor.term() == Some(term) {
                    state.apply(&spec.name, cursor.as_ref(), conditions)?;
                    checkpoint.tick(cursor.doc_freq() as u64);
                }
            }
            continue;
        }

        let Some(upper) = field_plan.upper_bound() else {
            continue;
        };
        while cursor.next()? {
            let Some(term) = cursor.term() else {
                break;
            };
            if term > upper {
                break;
            }
            let conditions = field_plan.matching(term);
            if !conditions.is_empty() {
                state.apply(&spec.name, cursor.as_ref(), &conditions)?;
            }
            checkpoint.tick(cursor.doc_freq() as u64);
        }
    }

    let MatchState {
        remapped, ranks, ..
    } = state;
    let negative_of: AHashMap<u32, u32> = rules
        .iter()
        .map(|r| (r.target_group, r.negative_group))
        .collect();

    let mut docs = Vec::with_capacity(FINALIZE_BLOCK);
    let mut groups = vec![0u32; FINALIZE_BLOCK];
    for start in (0..num_docs).step_by(FINALIZE_BLOCK) {
        let n = FINALIZE_BLOCK.min(num_docs - start);
        lookup.fill_groups_sequential(start as u32, &mut groups[..n]);
        docs.clear();
        docs.extend(start as u32..(start + n) as u32);
        for (i, group) in groups[..n].iter_mut().enumerate() {
            let doc = start + i;
            *group = if remapped.get(doc).unwrap_or(false) {
                positive_of[ranks[doc] as usize]
            } else {
                negative_of.get(&*group).copied().unwrap_or(0)
            };
        }
        lookup.batch_set(&docs, &groups[..n]);
        checkpoint.tick(n as u64);
    }
    lookup.recalculate_num_groups();

    debug!(
        "Regrouped shard {} with {} rules: {} groups",
        shard.name(),
        rules.len(),
        lookup.num_groups()
    );
    Ok(lookup.num_groups())
}
