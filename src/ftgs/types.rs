//! Record types carried by FTGS streams.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Integer-valued terms, ordered numerically.
    Int,
    /// Byte-string terms, ordered lexicographically.
    Str,
}

/// A field requested from an FTGS stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn int<S: Into<String>>(name: S) -> Self {
        FieldSpec {
            name: name.into(),
            kind: FieldKind::Int,
        }
    }

    pub fn string<S: Into<String>>(name: S) -> Self {
        FieldSpec {
            name: name.into(),
            kind: FieldKind::Str,
        }
    }
}

/// A distinct field value.
///
/// The derived ordering is the native one: numeric for `Int`, byte-wise for
/// `Str`. Terms of different kinds never share a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Int(i64),
    Str(Vec<u8>),
}

impl Term {
    /// Build a string term from UTF-8 text.
    pub fn str<S: AsRef<str>>(value: S) -> Self {
        Term::Str(value.as_ref().as_bytes().to_vec())
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Term::Int(_) => FieldKind::Int,
            Term::Str(_) => FieldKind::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            Term::Str(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Term::Int(_) => None,
            Term::Str(b) => Some(b),
        }
    }

    /// Feed the term's canonical bytes to `f`; used for stable hashing.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Term::Int(v) => f(&v.to_le_bytes()),
            Term::Str(b) => f(b),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{v}"),
            Term::Str(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Sparse per-group stat vectors for one term, groups ascending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupStats {
    num_stats: usize,
    groups: Vec<u32>,
    stats: Vec<i64>,
}

impl GroupStats {
    pub fn new(num_stats: usize) -> Self {
        GroupStats {
            num_stats,
            groups: Vec::new(),
            stats: Vec::new(),
        }
    }

    pub fn with_capacity(num_stats: usize, groups: usize) -> Self {
        GroupStats {
            num_stats,
            groups: Vec::with_capacity(groups),
            stats: Vec::with_capacity(groups * num_stats),
        }
    }

    /// Append a group; groups must be pushed in ascending order.
    pub fn push(&mut self, group: u32, stats: &[i64]) {
        debug_assert_eq!(stats.len(), self.num_stats);
        debug_assert!(self.groups.last().is_none_or(|&last| last < group));
        self.groups.push(group);
        self.stats.extend_from_slice(stats);
    }

    pub fn num_stats(&self) -> usize {
        self.num_stats
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    /// Stat vector of the `i`-th group entry.
    pub fn stats_at(&self, i: usize) -> &[i64] {
        &self.stats[i * self.num_stats..(i + 1) * self.num_stats]
    }

    /// Stat vector of `group`, if present.
    pub fn get(&self, group: u32) -> Option<&[i64]> {
        self.groups
            .binary_search(&group)
            .ok()
            .map(|i| self.stats_at(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[i64])> + '_ {
        self.groups
            .iter()
            .enumerate()
            .map(move |(i, &g)| (g, self.stats_at(i)))
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(u32, &[i64]) -> bool) {
        let n = self.num_stats;
        let mut write = 0;
        for read in 0..self.groups.len() {
            if keep(self.groups[read], &self.stats[read * n..(read + 1) * n]) {
                self.groups[write] = self.groups[read];
                self.stats.copy_within(read * n..(read + 1) * n, write * n);
                write += 1;
            }
        }
        self.groups.truncate(write);
        self.stats.truncate(write * n);
    }

    /// Approximate heap bytes.
    pub fn memory_used(&self) -> usize {
        self.groups.capacity() * 4 + self.stats.capacity() * 8
    }
}

/// One term of one field with its per-group stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtgsRecord {
    /// Index into the stream's field list.
    pub field: usize,
    pub term: Term,
    pub groups: GroupStats,
}

impl FtgsRecord {
    pub fn new(field: usize, term: Term, groups: GroupStats) -> Self {
        FtgsRecord {
            field,
            term,
            groups,
        }
    }

    /// Approximate heap bytes.
    pub fn memory_used(&self) -> usize {
        let term = match &self.term {
            Term::Int(_) => 8,
            Term::Str(b) => b.capacity(),
        };
        term + self.groups.memory_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        assert!(Term::Int(-5) < Term::Int(3));
        assert!(Term::str("abc") < Term::str("abd"));
        assert!(Term::str("ab") < Term::str("abc"));
        assert!(Term::Str(vec![0x7f]) < Term::Str(vec![0x80]));
    }

    #[test]
    fn test_group_stats_access() {
        let mut gs = GroupStats::new(2);
        gs.push(1, &[10, 20]);
        gs.push(4, &[1, 2]);
        gs.push(9, &[0, 7]);

        assert_eq!(gs.len(), 3);
        assert_eq!(gs.get(4), Some(&[1i64, 2][..]));
        assert_eq!(gs.get(5), None);

        gs.retain(|g, _| g != 4);
        assert_eq!(gs.groups(), &[1, 9]);
        assert_eq!(gs.stats_at(1), &[0, 7]);
    }

    #[test]
    fn test_group_stats_without_stats() {
        let mut gs = GroupStats::new(0);
        gs.push(2, &[]);
        gs.push(3, &[]);
        let collected: Vec<_> = gs.iter().map(|(g, s)| (g, s.len())).collect();
        assert_eq!(collected, vec![(2, 0), (3, 0)]);
    }
}
