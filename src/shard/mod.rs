//! Shard storage contract consumed by the engine.
//!
//! A shard exposes its document count, typed fields with sorted term
//! cursors, and per-document metrics with a declared `[min, max]` range.
//! [`MemoryShard`] is the in-process implementation used by tests and the
//! command line tool.

pub mod memory;
pub mod numeric;

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{FtgsError, Result};
use crate::ftgs::types::{FieldKind, FieldSpec, Term};

pub use memory::{MemoryShard, MemoryShardBuilder, ShardData};
pub use numeric::{StringToIntCursor, materialize_sorted};

/// Name of the built-in metric that is 1 for every document.
pub const COUNT_METRIC: &str = "count()";

/// One columnar partition of documents.
pub trait Shard: Send + Sync + Debug {
    /// Shard name, unique within a session.
    fn name(&self) -> &str;

    /// Number of documents; ids are `0..num_docs`.
    fn num_docs(&self) -> u32;

    /// Every field with its native kind.
    fn fields(&self) -> Vec<FieldSpec>;

    /// Native kind of `field`, if the shard has it.
    fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.fields()
            .into_iter()
            .find(|f| f.name == field)
            .map(|f| f.kind)
    }

    /// Sorted cursor over the terms of an int field.
    fn int_terms(&self, field: &str) -> Result<Box<dyn TermCursor>>;

    /// Sorted cursor over the terms of a string field.
    fn string_terms(&self, field: &str) -> Result<Box<dyn TermCursor>>;

    /// Per-document values of a metric.
    fn metric(&self, name: &str) -> Result<Arc<dyn IntValueLookup>>;
}

/// Cursor over the distinct terms of one field and their documents.
///
/// A fresh cursor sits before the first term. [`TermCursor::reset`] moves it
/// back before the first term `>=` the given one, so the following `next`
/// lands there.
pub trait TermCursor: Send {
    /// Advance to the next term.
    fn next(&mut self) -> Result<bool>;

    /// Current term, `None` before the first `next` or after exhaustion.
    fn term(&self) -> Option<&Term>;

    /// Ascending document ids of the current term.
    fn docs(&self) -> &[u32];

    /// Number of documents of the current term.
    fn doc_freq(&self) -> usize {
        self.docs().len()
    }

    /// Reposition before the first term `>= term`.
    fn reset(&mut self, term: &Term);

    /// Whether terms come out in ascending order.
    fn is_sorted(&self) -> bool {
        true
    }
}

/// Per-document integer values with a declared range.
pub trait IntValueLookup: Send + Sync + Debug {
    fn min(&self) -> i64;

    fn max(&self) -> i64;

    /// Write the value of `docs[i]` into `values[i]`.
    fn lookup(&self, docs: &[u32], values: &mut [i64]);

    /// Heap bytes held by the lookup.
    fn memory_used(&self) -> usize;
}

/// Cursor with no terms, used for fields a shard does not have.
#[derive(Debug, Default)]
pub struct EmptyCursor;

impl TermCursor for EmptyCursor {
    fn next(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn term(&self) -> Option<&Term> {
        None
    }

    fn docs(&self) -> &[u32] {
        &[]
    }

    fn reset(&mut self, _term: &Term) {}
}

/// Open a cursor producing terms of the kind `spec` asks for.
///
/// An int request over a string field goes through [`StringToIntCursor`],
/// skipping terms that do not parse; with `sorted` set the parsed terms are
/// materialized and sorted first. A field the shard lacks yields no terms.
pub fn open_terms(shard: &dyn Shard, spec: &FieldSpec, sorted: bool) -> Result<Box<dyn TermCursor>> {
    match (spec.kind, shard.field_kind(&spec.name)) {
        (_, None) => Ok(Box::new(EmptyCursor)),
        (FieldKind::Int, Some(FieldKind::Int)) => shard.int_terms(&spec.name),
        (FieldKind::Str, Some(FieldKind::Str)) => shard.string_terms(&spec.name),
        (FieldKind::Int, Some(FieldKind::Str)) => {
            let view = StringToIntCursor::new(shard.string_terms(&spec.name)?);
            if sorted {
                Ok(Box::new(materialize_sorted(Box::new(view))?))
            } else {
                Ok(Box::new(view))
            }
        }
        (FieldKind::Str, Some(FieldKind::Int)) => Err(FtgsError::invalid_argument(format!(
            "field {} is int-valued and cannot be read as strings",
            spec.name
        ))),
    }
}

/// Sorted cursor over terms held in memory.
#[derive(Debug, Clone)]
pub struct SliceCursor {
    terms: Arc<[(Term, Vec<u32>)]>,
    /// Index of the term `next` will move to.
    next: usize,
    current: Option<usize>,
}

impl SliceCursor {
    /// `terms` must be strictly ascending.
    pub fn new(terms: Arc<[(Term, Vec<u32>)]>) -> Self {
        SliceCursor {
            terms,
            next: 0,
            current: None,
        }
    }
}

impl TermCursor for SliceCursor {
    fn next(&mut self) -> Result<bool> {
        if self.next < self.terms.len() {
            self.current = Some(self.next);
            self.next += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    fn term(&self) -> Option<&Term> {
        self.current.map(|i| &self.terms[i].0)
    }

    fn docs(&self) -> &[u32] {
        match self.current {
            Some(i) => self.terms[i].1.as_slice(),
            None => &[],
        }
    }

    fn reset(&mut self, term: &Term) {
        self.next = self.terms.partition_point(|(t, _)| t < term);
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> SliceCursor {
        SliceCursor::new(
            vec![
                (Term::Int(1), vec![0]),
                (Term::Int(5), vec![1, 2]),
                (Term::Int(9), vec![3]),
            ]
            .into(),
        )
    }

    #[test]
    fn test_slice_cursor_walk() {
        let mut c = cursor();
        assert!(c.term().is_none());
        assert!(c.next().unwrap());
        assert_eq!(c.term(), Some(&Term::Int(1)));
        assert!(c.next().unwrap());
        assert_eq!(c.docs(), &[1, 2]);
        assert_eq!(c.doc_freq(), 2);
        assert!(c.next().unwrap());
        assert!(!c.next().unwrap());
        assert!(c.term().is_none());
    }

    #[test]
    fn test_slice_cursor_reset() {
        let mut c = cursor();
        c.reset(&Term::Int(4));
        assert!(c.next().unwrap());
        assert_eq!(c.term(), Some(&Term::Int(5)));
        c.reset(&Term::Int(10));
        assert!(!c.next().unwrap());
        c.reset(&Term::Int(i64::MIN));
        assert!(c.next().unwrap());
        assert_eq!(c.term(), Some(&Term::Int(1)));
    }
}
