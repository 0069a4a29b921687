//! Salted probabilistic regroup.

use bit_vec::BitVec;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{FtgsError, Result};
use crate::group::GroupLookup;
use crate::memory::MemoryBudget;
use crate::scheduler::YieldCheckpoint;
use crate::shard::IntValueLookup;

/// Seed of the salted hash; fixed so results reproduce across processes.
pub const SALT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

const BLOCK: usize = 8192;

/// Map `(salt, value)` to a uniform fraction in `[0, 1)`.
pub fn salted_fraction(salt: &str, value: i64) -> f64 {
    let mut bytes = Vec::with_capacity(salt.len() + 8);
    bytes.extend_from_slice(salt.as_bytes());
    bytes.extend_from_slice(&value.to_le_bytes());
    let hash = xxh3_64_with_seed(&bytes, SALT_SEED);
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

/// Split the documents of `target_group` on `metric`: a document goes to
/// `positive_group` when the salted fraction of its value is below `p`,
/// otherwise to `negative_group`. Returns the new number of groups.
///
/// The same `(salt, value)` always lands on the same side, whatever shard
/// or run it is seen in.
#[allow(clippy::too_many_arguments)]
pub fn random_metric_regroup(
    lookup: &mut GroupLookup,
    metric: &dyn IntValueLookup,
    salt: &str,
    p: f64,
    target_group: u32,
    negative_group: u32,
    positive_group: u32,
    budget: &MemoryBudget,
    checkpoint: &mut YieldCheckpoint,
) -> Result<u32> {
    if !(0.0..=1.0).contains(&p) {
        return Err(FtgsError::invalid_argument(format!(
            "probability {p} is outside [0, 1]"
        )));
    }
    let num_docs = lookup.size();
    let _claim = budget.claim(num_docs.div_ceil(8) as u64)?;

    let mut members = BitVec::from_elem(num_docs, false);
    let mut docs = Vec::with_capacity(BLOCK);
    let mut groups = vec![0u32; BLOCK];
    let mut values = vec![0i64; BLOCK];
    for start in (0..num_docs).step_by(BLOCK) {
        let n = BLOCK.min(num_docs - start);
        lookup.fill_groups_sequential(start as u32, &mut groups[..n]);
        docs.clear();
        docs.extend(
            (0..n)
                .filter(|&i| groups[i] == target_group)
                .map(|i| (start + i) as u32),
        );
        metric.lookup(&docs, &mut values[..docs.len()]);
        for (&doc, &value) in docs.iter().zip(&values) {
            if salted_fraction(salt, value) < p {
                members.set(doc as usize, true);
            }
        }
        checkpoint.tick(n as u64);
    }

    lookup.bit_set_regroup(&members, target_group, negative_group, positive_group);
    Ok(lookup.num_groups())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::PackedTable;
    use crate::shard::{MemoryShard, Shard};

    fn run(salt: &str, p: f64, values: &[i64]) -> Vec<u32> {
        let shard = MemoryShard::builder("s", values.len() as u32)
            .int_column("v", values.to_vec())
            .build()
            .unwrap();
        let metric = shard.metric("v").unwrap();
        let mut lookup = GroupLookup::new(PackedTable::new(values.len(), &[]).unwrap(), 1);
        random_metric_regroup(
            &mut lookup,
            metric.as_ref(),
            salt,
            p,
            1,
            2,
            3,
            &MemoryBudget::unlimited(),
            &mut YieldCheckpoint::disabled(),
        )
        .unwrap();
        (0..values.len() as u32).map(|d| lookup.get(d)).collect()
    }

    #[test]
    fn test_deterministic() {
        let values: Vec<i64> = (0..500).collect();
        assert_eq!(run("salt", 0.3, &values), run("salt", 0.3, &values));
    }

    #[test]
    fn test_equal_values_share_a_side() {
        let groups = run("x", 0.5, &[7, 7, 7, 7]);
        assert!(groups.iter().all(|&g| g == groups[0]));
    }

    #[test]
    fn test_salt_changes_assignment() {
        let values: Vec<i64> = (0..500).collect();
        assert_ne!(run("a", 0.5, &values), run("b", 0.5, &values));
    }

    #[test]
    fn test_probability_bounds() {
        let values: Vec<i64> = (0..100).collect();
        assert!(run("s", 0.0, &values).iter().all(|&g| g == 2));
        assert!(run("s", 1.0, &values).iter().all(|&g| g == 3));

        let positive = run("s", 0.25, &(0..4000).collect::<Vec<_>>())
            .iter()
            .filter(|&&g| g == 3)
            .count();
        assert!((800..1200).contains(&positive), "{positive}");
    }

    #[test]
    fn test_invalid_probability() {
        let mut lookup = GroupLookup::new(PackedTable::new(1, &[]).unwrap(), 1);
        let shard = MemoryShard::builder("s", 1).int_column("v", vec![1]).build().unwrap();
        let err = random_metric_regroup(
            &mut lookup,
            shard.metric("v").unwrap().as_ref(),
            "s",
            1.5,
            1,
            2,
            3,
            &MemoryBudget::unlimited(),
            &mut YieldCheckpoint::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, FtgsError::InvalidArgument(_)));
    }
}
