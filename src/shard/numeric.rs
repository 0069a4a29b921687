//! Integer view over string-valued fields.

use std::collections::BTreeMap;

use crate::error::{FtgsError, Result};
use crate::ftgs::types::Term;
use crate::scheduler::YieldCheckpoint;
use crate::shard::{SliceCursor, TermCursor};

/// Presents the terms of a string field that parse as `i64` as int terms.
///
/// Terms come out in the string order of the underlying cursor, which is
/// not numeric order ("10" sorts before "9"), so the view is unsorted.
///
/// A number can only start with `+`, `-` or a digit (`'+' < ',' < '-' < '.'
/// < '/' < '0'..='9'` in byte order). When a term fails to parse the cursor
/// jumps over the byte range that cannot hold numbers, and stops outright
/// once past `'9'`.
pub struct StringToIntCursor {
    inner: Box<dyn TermCursor>,
    current: Option<Term>,
    checkpoint: YieldCheckpoint,
}

impl StringToIntCursor {
    pub fn new(inner: Box<dyn TermCursor>) -> Self {
        StringToIntCursor {
            inner,
            current: None,
            checkpoint: YieldCheckpoint::disabled(),
        }
    }

    /// Poll `checkpoint` after every term that fails to parse; long runs of
    /// non-numeric terms otherwise hold a CPU slot without yielding.
    pub fn with_checkpoint(mut self, checkpoint: YieldCheckpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    fn parse(bytes: &[u8]) -> Option<i64> {
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }
}

impl TermCursor for StringToIntCursor {
    fn next(&mut self) -> Result<bool> {
        while self.inner.next()? {
            let Some(bytes) = self.inner.term().and_then(Term::as_bytes) else {
                return Err(FtgsError::illegal_state(
                    "string-to-int view over a cursor that does not produce strings",
                ));
            };
            if let Some(value) = Self::parse(bytes) {
                self.current = Some(Term::Int(value));
                return Ok(true);
            }

            self.checkpoint.tick(1);
            let Some(&first) = bytes.first() else {
                continue;
            };
            match first {
                b if b < b'+' => self.inner.reset(&Term::str("+0")),
                b',' => self.inner.reset(&Term::str("-0")),
                b'.' | b'/' => self.inner.reset(&Term::str("0")),
                b if b > b'9' => break,
                _ => {}
            }
        }
        self.current = None;
        Ok(false)
    }

    fn term(&self) -> Option<&Term> {
        self.current.as_ref()
    }

    fn docs(&self) -> &[u32] {
        if self.current.is_some() {
            self.inner.docs()
        } else {
            &[]
        }
    }

    fn reset(&mut self, term: &Term) {
        self.current = None;
        match term {
            Term::Int(v) => self.inner.reset(&Term::str(v.to_string())),
            Term::Str(_) => self.inner.reset(term),
        }
    }

    fn is_sorted(&self) -> bool {
        false
    }
}

/// Drain `cursor` and return a sorted cursor over its terms. Doc lists of
/// terms that occur more than once (`"7"` and `"07"` both parse to 7) are
/// merged.
pub fn materialize_sorted(mut cursor: Box<dyn TermCursor>) -> Result<SliceCursor> {
    let mut terms: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
    while cursor.next()? {
        let Some(term) = cursor.term().cloned() else {
            break;
        };
        terms.entry(term).or_default().extend_from_slice(cursor.docs());
    }

    let terms: Vec<(Term, Vec<u32>)> = terms
        .into_iter()
        .map(|(term, mut docs)| {
            docs.sort_unstable();
            docs.dedup();
            (term, docs)
        })
        .collect();
    Ok(SliceCursor::new(terms.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(terms: &[&str]) -> Box<dyn TermCursor> {
        let mut sorted: Vec<&str> = terms.to_vec();
        sorted.sort();
        let terms: Vec<(Term, Vec<u32>)> = sorted
            .into_iter()
            .enumerate()
            .map(|(i, t)| (Term::str(t), vec![i as u32]))
            .collect();
        Box::new(SliceCursor::new(terms.into()))
    }

    fn collect(cursor: &mut dyn TermCursor) -> Vec<i64> {
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            out.push(cursor.term().and_then(Term::as_int).unwrap());
        }
        out
    }

    #[test]
    fn test_parses_in_string_order() {
        let mut view = StringToIntCursor::new(strings(&["10", "9", "-3", "+4", "abc", ""]));
        assert!(!view.is_sorted());
        assert_eq!(collect(&mut view), vec![4, -3, 10, 9]);
    }

    #[test]
    fn test_skips_non_numeric_ranges() {
        // '!' < '+' jumps to "+0"; ',' jumps to "-0"; '.' jumps to "0"; 'z' ends
        let mut view = StringToIntCursor::new(strings(&[
            "!x", "#y", "+1", ",a", "-2", ".5", "/x", "3", "3x", "z", "zz9",
        ]));
        assert_eq!(collect(&mut view), vec![1, -2, 3]);
    }

    #[test]
    fn test_materialize_sorted_merges_docs() {
        let view = StringToIntCursor::new(strings(&["07", "7", "10", "9"]));
        let mut sorted = materialize_sorted(Box::new(view)).unwrap();
        assert!(sorted.next().unwrap());
        assert_eq!(sorted.term(), Some(&Term::Int(7)));
        assert_eq!(sorted.docs().len(), 2);
        assert_eq!(collect(&mut sorted), vec![9, 10]);
    }

    #[test]
    fn test_reset_by_int() {
        let mut view = StringToIntCursor::new(strings(&["1", "2", "3"]));
        view.reset(&Term::Int(2));
        assert_eq!(collect(&mut view), vec![2, 3]);
    }
}
