//! Remap rule definitions.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{FtgsError, Result};
use crate::ftgs::types::{FieldSpec, Term};

/// A test of one field against one term.
///
/// Equality conditions match documents having exactly `term`. Inequality
/// conditions match documents having any term `<= term`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegroupCondition {
    pub field: String,
    pub int_type: bool,
    #[serde(default)]
    pub int_term: i64,
    #[serde(default)]
    pub string_term: String,
    #[serde(default)]
    pub inequality: bool,
}

impl RegroupCondition {
    pub fn int_eq<S: Into<String>>(field: S, term: i64) -> Self {
        RegroupCondition {
            field: field.into(),
            int_type: true,
            int_term: term,
            string_term: String::new(),
            inequality: false,
        }
    }

    pub fn string_eq<S: Into<String>, T: Into<String>>(field: S, term: T) -> Self {
        RegroupCondition {
            field: field.into(),
            int_type: false,
            int_term: 0,
            string_term: term.into(),
            inequality: false,
        }
    }

    /// `field <= bound`.
    pub fn int_le<S: Into<String>>(field: S, bound: i64) -> Self {
        RegroupCondition {
            inequality: true,
            ..Self::int_eq(field, bound)
        }
    }

    /// `field <= bound`, byte-wise.
    pub fn string_le<S: Into<String>, T: Into<String>>(field: S, bound: T) -> Self {
        RegroupCondition {
            inequality: true,
            ..Self::string_eq(field, bound)
        }
    }

    /// The field as it must be read to evaluate this condition.
    pub fn field_spec(&self) -> FieldSpec {
        if self.int_type {
            FieldSpec::int(self.field.clone())
        } else {
            FieldSpec::string(self.field.clone())
        }
    }

    pub fn term(&self) -> Term {
        if self.int_type {
            Term::Int(self.int_term)
        } else {
            Term::str(&self.string_term)
        }
    }

    /// Whether a document having `term` satisfies the condition.
    pub fn matches(&self, term: &Term) -> bool {
        let own = self.term();
        if self.inequality {
            term <= &own
        } else {
            *term == own
        }
    }
}

/// Remaps documents currently in `target_group`: a document gets
/// `positive_groups[i]` for the first condition `i` it satisfies, and
/// `negative_group` if it satisfies none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMultiRemapRule {
    pub target_group: u32,
    pub negative_group: u32,
    pub positive_groups: Vec<u32>,
    pub conditions: Vec<RegroupCondition>,
}

impl GroupMultiRemapRule {
    /// A rule with no conditions yet: everything in `target_group` goes to
    /// `negative_group`.
    pub fn new(target_group: u32, negative_group: u32) -> Self {
        GroupMultiRemapRule {
            target_group,
            negative_group,
            positive_groups: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Append a condition with lower priority than the existing ones.
    pub fn when(mut self, condition: RegroupCondition, positive_group: u32) -> Self {
        self.conditions.push(condition);
        self.positive_groups.push(positive_group);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.target_group == 0 {
            return Err(FtgsError::invalid_argument(
                "remap rules cannot target group 0",
            ));
        }
        if self.positive_groups.len() != self.conditions.len() {
            return Err(FtgsError::invalid_argument(format!(
                "rule for group {} has {} conditions but {} positive groups",
                self.target_group,
                self.conditions.len(),
                self.positive_groups.len()
            )));
        }
        Ok(())
    }
}

/// Single-condition remap rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRemapRule {
    pub target_group: u32,
    pub condition: RegroupCondition,
    pub negative_group: u32,
    pub positive_group: u32,
}

impl From<GroupRemapRule> for GroupMultiRemapRule {
    fn from(rule: GroupRemapRule) -> Self {
        GroupMultiRemapRule::new(rule.target_group, rule.negative_group)
            .when(rule.condition, rule.positive_group)
    }
}

/// Fold single-condition rules into multi-condition rules, one per target
/// group, keeping the given order as condition priority. Rules sharing a
/// target must agree on the negative group.
pub fn merge_single_rules(rules: &[GroupRemapRule]) -> Result<Vec<GroupMultiRemapRule>> {
    let mut merged: Vec<GroupMultiRemapRule> = Vec::new();
    for rule in rules {
        match merged.iter_mut().find(|m| m.target_group == rule.target_group) {
            Some(existing) if existing.negative_group != rule.negative_group => {
                return Err(FtgsError::invalid_argument(format!(
                    "rules for group {} disagree on the negative group ({} vs {})",
                    rule.target_group, existing.negative_group, rule.negative_group
                )));
            }
            Some(existing) => {
                existing.conditions.push(rule.condition.clone());
                existing.positive_groups.push(rule.positive_group);
            }
            None => merged.push(rule.clone().into()),
        }
    }
    Ok(merged)
}

/// Check every rule and reject two rules with the same target group.
pub fn validate_rules(rules: &[GroupMultiRemapRule]) -> Result<()> {
    let mut targets = AHashSet::with_capacity(rules.len());
    for rule in rules {
        rule.validate()?;
        if !targets.insert(rule.target_group) {
            return Err(FtgsError::invalid_argument(format!(
                "more than one rule targets group {}",
                rule.target_group
            )));
        }
    }
    Ok(())
}
