//! Document → group assignment with per-document stat columns.

use bit_vec::BitVec;

use crate::error::{FtgsError, Result};
use crate::group::packed::PackedTable;

/// A remap condition that matched the current term, as seen by the lookup:
/// documents currently in `target_group` match it with rank `priority`
/// (lower wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionMatch {
    pub target_group: u32,
    pub priority: u32,
}

/// Sentinel in the per-document match ranks for "not matched".
pub const UNMATCHED: u32 = u32::MAX;

/// Per-shard group assignment plus the packed stat values of the active
/// stat stack.
#[derive(Debug, Clone)]
pub struct GroupLookup {
    table: PackedTable,
    num_groups: u32,
}

impl GroupLookup {
    /// Lookup over `table`, every document in group `initial_group`.
    pub fn new(mut table: PackedTable, initial_group: u32) -> Self {
        for row in 0..table.num_rows() {
            table.set_group(row, initial_group);
        }
        GroupLookup {
            table,
            num_groups: initial_group + 1,
        }
    }

    /// Number of documents.
    pub fn size(&self) -> usize {
        self.table.num_rows()
    }

    /// Exclusive upper bound of the assigned group ids.
    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    pub fn num_stats(&self) -> usize {
        self.table.num_stats()
    }

    #[inline]
    pub fn get(&self, doc: u32) -> u32 {
        self.table.group(doc as usize)
    }

    #[inline]
    pub fn set(&mut self, doc: u32, group: u32) {
        self.table.set_group(doc as usize, group);
        if group >= self.num_groups {
            self.num_groups = group + 1;
        }
    }

    /// Assign `groups[i]` to `docs[i]`.
    pub fn batch_set(&mut self, docs: &[u32], groups: &[u32]) {
        debug_assert_eq!(docs.len(), groups.len());
        let mut max = 0;
        for (&doc, &group) in docs.iter().zip(groups) {
            self.table.set_group(doc as usize, group);
            max = max.max(group);
        }
        if !docs.is_empty() && max >= self.num_groups {
            self.num_groups = max + 1;
        }
    }

    /// Read the groups of `docs` into `out`.
    pub fn fill_groups_for_docs(&self, docs: &[u32], out: &mut [u32]) {
        for (slot, &doc) in out.iter_mut().zip(docs) {
            *slot = self.table.group(doc as usize);
        }
    }

    /// Read the groups of documents `start..start + out.len()` into `out`.
    pub fn fill_groups_sequential(&self, start: u32, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.table.group(start as usize + i);
        }
    }

    /// Read stat `stat` of `docs` into `out`, clipped to the stat's range.
    pub fn lookup_stat(&self, stat: usize, docs: &[u32], out: &mut [i64]) {
        for (slot, &doc) in out.iter_mut().zip(docs) {
            *slot = self.table.stat(doc as usize, stat);
        }
    }

    /// Declared `[min, max]` of stat `stat`.
    pub fn stat_range(&self, stat: usize) -> (i64, i64) {
        self.table.range(stat)
    }

    /// Put every document in `group`.
    pub fn fill(&mut self, group: u32) {
        for row in 0..self.table.num_rows() {
            self.table.set_group(row, group);
        }
        self.num_groups = group + 1;
    }

    /// Copy every document's group into `other`, which must be the same size.
    pub fn copy_into(&self, other: &mut GroupLookup) -> Result<()> {
        if other.size() != self.size() {
            return Err(FtgsError::invalid_argument(format!(
                "cannot copy {} groups into a lookup of size {}",
                self.size(),
                other.size()
            )));
        }
        for row in 0..self.table.num_rows() {
            other.table.set_group(row, self.table.group(row));
        }
        other.num_groups = self.num_groups;
        Ok(())
    }

    /// Recompute `num_groups` from the assigned groups.
    pub fn recalculate_num_groups(&mut self) {
        let max = (0..self.table.num_rows())
            .map(|row| self.table.group(row))
            .max()
            .unwrap_or(0);
        self.num_groups = max + 1;
    }

    /// Number of documents per group, indexed by group id.
    pub fn group_counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.num_groups as usize];
        for row in 0..self.table.num_rows() {
            counts[self.table.group(row) as usize] += 1;
        }
        counts
    }

    /// Split the documents of `target_group`: those whose bit is set in
    /// `members` go to `positive_group`, the rest to `negative_group`.
    /// Other documents keep their group.
    pub fn bit_set_regroup(
        &mut self,
        members: &BitVec,
        target_group: u32,
        negative_group: u32,
        positive_group: u32,
    ) {
        for row in 0..self.table.num_rows() {
            if self.table.group(row) == target_group {
                let group = if members.get(row).unwrap_or(false) {
                    positive_group
                } else {
                    negative_group
                };
                self.table.set_group(row, group);
            }
        }
        self.recalculate_num_groups();
    }

    /// Record matches of the int term `term` of `field` for `docs`.
    ///
    /// `conditions` are every condition matching this term, ordered by
    /// priority. A document matches the first one whose target is the
    /// document's current group and keeps the best rank it has seen. With
    /// `error_on_collision`, a document matched by two different conditions
    /// fails the call with [`FtgsError::RuleCollision`]. Groups are not
    /// modified; the caller applies the ranks once every condition has been
    /// evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_int_conditions(
        &self,
        docs: &[u32],
        already_remapped: &mut BitVec,
        ranks: &mut [u32],
        conditions: &[ConditionMatch],
        error_on_collision: bool,
        field: &str,
        term: i64,
    ) -> Result<()> {
        self.apply_conditions(docs, already_remapped, ranks, conditions, error_on_collision, || {
            format!("{field}={term}")
        })
    }

    /// String-term counterpart of [`GroupLookup::apply_int_conditions`].
    #[allow(clippy::too_many_arguments)]
    pub fn apply_string_conditions(
        &self,
        docs: &[u32],
        already_remapped: &mut BitVec,
        ranks: &mut [u32],
        conditions: &[ConditionMatch],
        error_on_collision: bool,
        field: &str,
        term: &[u8],
    ) -> Result<()> {
        self.apply_conditions(docs, already_remapped, ranks, conditions, error_on_collision, || {
            format!("{field}:{}", String::from_utf8_lossy(term))
        })
    }

    fn apply_conditions(
        &self,
        docs: &[u32],
        already_remapped: &mut BitVec,
        ranks: &mut [u32],
        conditions: &[ConditionMatch],
        error_on_collision: bool,
        describe: impl Fn() -> String,
    ) -> Result<()> {
        for &doc in docs {
            let group = self.get(doc);
            let mut matching = conditions.iter().filter(|c| c.target_group == group);
            let Some(condition) = matching.next() else {
                continue;
            };
            if error_on_collision {
                if let Some(other) = matching.next() {
                    return Err(FtgsError::RuleCollision {
                        doc,
                        message: format!(
                            "matched by conditions {} and {} ({})",
                            condition.priority,
                            other.priority,
                            describe()
                        ),
                    });
                }
            }
            let d = doc as usize;
            if already_remapped.get(d).unwrap_or(false) {
                if ranks[d] == condition.priority {
                    continue;
                }
                if error_on_collision {
                    return Err(FtgsError::RuleCollision {
                        doc,
                        message: format!(
                            "matched by conditions {} and {} ({})",
                            ranks[d].min(condition.priority),
                            ranks[d].max(condition.priority),
                            describe()
                        ),
                    });
                }
                ranks[d] = ranks[d].min(condition.priority);
            } else {
                already_remapped.set(d, true);
                ranks[d] = condition.priority;
            }
        }
        Ok(())
    }

    /// Heap bytes held by the lookup.
    pub fn memory_used(&self) -> usize {
        self.table.memory_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(num_docs: usize) -> GroupLookup {
        GroupLookup::new(PackedTable::new(num_docs, &[(0, 1000)]).unwrap(), 1)
    }

    #[test]
    fn test_point_and_batch_access() {
        let mut l = lookup(6);
        assert_eq!(l.num_groups(), 2);
        l.set(2, 5);
        l.batch_set(&[0, 4], &[3, 3]);
        assert_eq!(l.num_groups(), 6);

        let mut out = [0u32; 3];
        l.fill_groups_for_docs(&[4, 2, 1], &mut out);
        assert_eq!(out, [3, 5, 1]);
        l.fill_groups_sequential(0, &mut out);
        assert_eq!(out, [3, 1, 5]);
        assert_eq!(l.group_counts(), vec![0, 3, 0, 2, 0, 1]);
    }

    #[test]
    fn test_recalculate_and_fill() {
        let mut l = lookup(3);
        l.set(0, 9);
        l.set(0, 2);
        assert_eq!(l.num_groups(), 10);
        l.recalculate_num_groups();
        assert_eq!(l.num_groups(), 3);
        l.fill(0);
        assert_eq!(l.num_groups(), 1);
        assert_eq!(l.get(2), 0);
    }

    #[test]
    fn test_copy_into() {
        let mut a = lookup(3);
        a.set(1, 4);
        let mut b = GroupLookup::new(PackedTable::new(3, &[]).unwrap(), 0);
        a.copy_into(&mut b).unwrap();
        assert_eq!(b.get(1), 4);
        assert_eq!(b.num_groups(), 5);
        assert!(a.copy_into(&mut lookup(2)).is_err());
    }

    #[test]
    fn test_bit_set_regroup() {
        let mut l = lookup(4);
        l.set(3, 7);
        let mut members = BitVec::from_elem(4, false);
        members.set(1, true);
        members.set(3, true);
        l.bit_set_regroup(&members, 1, 2, 3);
        assert_eq!((0..4).map(|d| l.get(d)).collect::<Vec<_>>(), vec![2, 3, 2, 7]);
    }

    #[test]
    fn test_conditions_keep_best_rank() {
        let l = lookup(3);
        let mut remapped = BitVec::from_elem(3, false);
        let mut ranks = vec![UNMATCHED; 3];
        let late = [ConditionMatch {
            target_group: 1,
            priority: 4,
        }];
        let early = [ConditionMatch {
            target_group: 1,
            priority: 1,
        }];

        l.apply_int_conditions(&[0, 1], &mut remapped, &mut ranks, &late, false, "f", 1)
            .unwrap();
        l.apply_int_conditions(&[1], &mut remapped, &mut ranks, &early, false, "f", 2)
            .unwrap();
        assert_eq!(ranks, vec![4, 1, UNMATCHED]);

        let err = l
            .apply_string_conditions(&[0], &mut remapped, &mut ranks, &early, true, "g", b"x")
            .unwrap_err();
        assert!(matches!(err, FtgsError::RuleCollision { doc: 0, .. }));
    }

    #[test]
    fn test_two_conditions_on_one_term() {
        let l = lookup(2);
        let both = [
            ConditionMatch {
                target_group: 1,
                priority: 0,
            },
            ConditionMatch {
                target_group: 1,
                priority: 1,
            },
        ];
        let mut remapped = BitVec::from_elem(2, false);
        let mut ranks = vec![UNMATCHED; 2];
        l.apply_int_conditions(&[0, 1], &mut remapped, &mut ranks, &both, false, "x", 1)
            .unwrap();
        assert_eq!(ranks, vec![0, 0]);

        let mut remapped = BitVec::from_elem(2, false);
        let mut ranks = vec![UNMATCHED; 2];
        assert!(
            l.apply_int_conditions(&[0], &mut remapped, &mut ranks, &both, true, "x", 1)
                .is_err()
        );
    }

    #[test]
    fn test_stats_are_read_clipped() {
        let mut l = lookup(2);
        l.table.set_stat(1, 0, 5000);
        let mut out = [0i64; 2];
        l.lookup_stat(0, &[0, 1], &mut out);
        assert_eq!(out, [0, 1000]);
    }
}
