//! Distinct term counts per group.

use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::FtgsIterator;

/// Count, per group, the terms that occur in at least one of the group's
/// documents. The stream must carry a single field. The returned vector is
/// indexed by group id; entry 0 is always zero.
///
/// The iterator is consumed and closed.
pub fn calculate_distinct<I: FtgsIterator + ?Sized>(iterator: &mut I) -> Result<Vec<i64>> {
    let result = (|| {
        if iterator.fields().len() != 1 {
            return Err(FtgsError::invalid_argument(format!(
                "distinct needs exactly one field, got {}",
                iterator.fields().len()
            )));
        }

        let mut counts = vec![0i64; iterator.num_groups() as usize];
        while let Some(record) = iterator.next_record()? {
            for &group in record.groups.groups() {
                let slot = counts.get_mut(group as usize).ok_or_else(|| {
                    FtgsError::illegal_state(format!("group {group} beyond declared group count"))
                })?;
                *slot += 1;
            }
        }
        Ok(counts)
    })();
    iterator.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::iterator::VecFtgsIterator;
    use crate::ftgs::types::{FieldSpec, FtgsRecord, GroupStats, Term};

    #[test]
    fn test_distinct_counts() {
        let mk = |term: &str, groups: &[u32]| {
            let mut gs = GroupStats::new(0);
            for &g in groups {
                gs.push(g, &[]);
            }
            FtgsRecord::new(0, Term::str(term), gs)
        };
        let mut input = VecFtgsIterator::new(
            vec![FieldSpec::string("country")],
            0,
            4,
            true,
            vec![mk("de", &[1, 2]), mk("fr", &[2]), mk("us", &[1, 2, 3])],
        );
        assert_eq!(calculate_distinct(&mut input).unwrap(), vec![0, 2, 3, 1]);
        assert!(input.is_closed());
    }

    #[test]
    fn test_distinct_needs_one_field() {
        let mut input = VecFtgsIterator::empty(vec![FieldSpec::int("a"), FieldSpec::int("b")], 0, 2);
        assert!(calculate_distinct(&mut input).is_err());
        assert!(input.is_closed());
    }
}
