mod common;

use std::io;
use std::sync::Arc;

use ftgs::config::FtgsParams;
use ftgs::error::{FtgsError, Result};
use ftgs::ftgs::{
    FieldSpec, FtgsIterator, FtgsMerger, FtgsRecord, GroupStats, SortedInterleaver, Term, VecFtgsIterator,
    drain, split,
};
use ftgs::memory::TempBudget;
use ftgs::regroup::{GroupMultiRemapRule, RegroupCondition};
use ftgs::session::MultiSession;
use ftgs::shard::{IntValueLookup, MemoryShard, Shard, TermCursor};

use common::{COLORS, context, expected, flatten, random_columns};

fn record(field: usize, term: Term, groups: &[(u32, i64)]) -> FtgsRecord {
    let mut stats = GroupStats::new(1);
    for &(group, value) in groups {
        stats.push(group, &[value]);
    }
    FtgsRecord::new(field, term, stats)
}

fn source(records: Vec<FtgsRecord>) -> Box<dyn FtgsIterator> {
    Box::new(VecFtgsIterator::new(vec![FieldSpec::string("s")], 1, 4, true, records))
}

#[test]
fn test_merge_sums_matching_terms() {
    let a = source(vec![
        record(0, Term::str("abc"), &[(3, 5)]),
        record(0, Term::str("abd"), &[(1, 2)]),
    ]);
    let b = source(vec![
        record(0, Term::str("abc"), &[(3, 7)]),
        record(0, Term::str("xyz"), &[(2, 9)]),
    ]);
    let mut merger = FtgsMerger::new(vec![a, b]).unwrap();
    let merged = drain(&mut merger).unwrap();

    assert_eq!(
        merged,
        vec![
            record(0, Term::str("abc"), &[(3, 12)]),
            record(0, Term::str("abd"), &[(1, 2)]),
            record(0, Term::str("xyz"), &[(2, 9)]),
        ]
    );
}

#[test]
fn test_split_then_interleave_is_identity() -> Result<()> {
    let records: Vec<FtgsRecord> = (0..500)
        .map(|i| record(0, Term::str(format!("term-{i:04}")), &[(1 + (i % 3) as u32, i)]))
        .collect();
    let budget = TempBudget::new(1 << 24);

    let mut input = source(records.clone());
    let buckets = split(&mut input, 5, &budget)?;
    assert!(input.is_closed());
    assert_eq!(buckets.len(), 5);

    let mut interleaved = SortedInterleaver::new(buckets)?;
    assert_eq!(drain(&mut interleaved)?, records);
    assert_eq!(budget.remaining(), 1 << 24);
    Ok(())
}

fn regrouped_session(columns: &[common::ShardColumns], splits: usize) -> MultiSession {
    let shards = columns
        .iter()
        .enumerate()
        .map(|(i, c)| c.shard(&format!("shard-{i}")))
        .collect();
    let session = MultiSession::new(context(splits), None, shards).unwrap();
    session.push_stat("count()").unwrap();
    session.push_stat("x").unwrap();
    let rule = GroupMultiRemapRule::new(1, 1)
        .when(RegroupCondition::string_eq("c", "red"), 2)
        .when(RegroupCondition::string_eq("c", "violet"), 0);
    assert_eq!(session.regroup(&[rule], false).unwrap(), 3);
    session
}

fn group_of(_x: i64, c: &str) -> u32 {
    match c {
        "red" => 2,
        "violet" => 0,
        _ => 1,
    }
}

#[test]
fn test_multi_session_matches_reference_in_order() {
    let columns = random_columns(7, 4, 300);
    let session = regrouped_session(&columns, 3);

    let params = FtgsParams::new(vec![FieldSpec::int("x"), FieldSpec::string("c")]);
    let mut iterator = session.ftgs_iterator(&params).unwrap();
    assert!(iterator.is_sorted());
    assert_eq!(iterator.num_groups(), 3);
    let actual = flatten(drain(&mut iterator).unwrap());

    assert_eq!(actual, expected(&columns, group_of));
    assert!(actual.iter().all(|(_, term, _)| *term != Term::str("violet")));
}

#[test]
fn test_unsorted_request_has_same_content() {
    let columns = random_columns(11, 3, 200);
    let session = regrouped_session(&columns, 4);

    let params = FtgsParams::new(vec![FieldSpec::int("x"), FieldSpec::string("c")]).with_sorted(false);
    let mut actual = flatten(drain(&mut session.ftgs_iterator(&params).unwrap()).unwrap());
    actual.sort();
    assert_eq!(actual, expected(&columns, group_of));
}

#[test]
fn test_term_limit_keeps_smallest_terms() {
    let columns = random_columns(3, 3, 100);
    let session = regrouped_session(&columns, 2);

    let params = FtgsParams::new(vec![FieldSpec::int("x"), FieldSpec::string("c")]).with_term_limit(3);
    let actual = flatten(drain(&mut session.ftgs_iterator(&params).unwrap()).unwrap());

    let reference = expected(&columns, group_of);
    let mut wanted: Vec<_> = reference.iter().filter(|r| r.0 == 0).take(3).cloned().collect();
    wanted.extend(reference.iter().filter(|r| r.0 == 1).take(3).cloned());
    assert_eq!(actual, wanted);
}

#[test]
fn test_top_terms_across_shards() {
    let a = Arc::new(
        MemoryShard::builder("a", 2)
            .int_column("t", vec![10, 3])
            .build()
            .unwrap(),
    ) as Arc<dyn Shard>;
    let b = Arc::new(
        MemoryShard::builder("b", 2)
            .int_column("t", vec![7, 9])
            .build()
            .unwrap(),
    ) as Arc<dyn Shard>;
    let session = MultiSession::new(context(2), None, vec![a, b]).unwrap();
    session.push_stat("t").unwrap();

    let params = FtgsParams::new(vec![FieldSpec::int("t")]).with_top_terms(2, 0);
    let mut iterator = session.ftgs_iterator(&params).unwrap();
    assert!(!iterator.is_sorted());
    let top: Vec<(Term, i64)> = drain(&mut iterator)
        .unwrap()
        .into_iter()
        .map(|r| (r.term, r.groups.get(1).unwrap()[0]))
        .collect();
    assert_eq!(top, vec![(Term::Int(10), 10), (Term::Int(9), 9)]);
}

#[test]
fn test_distinct_over_shards() {
    let columns = random_columns(5, 3, 150);
    let session = regrouped_session(&columns, 3);

    let counts = session.distinct("c", false).unwrap();
    assert_eq!(counts.len(), 3);
    assert_eq!(counts[1], (COLORS.len() - 2) as i64);
    assert_eq!(counts[2], 1);
}

/// A shard whose int fields cannot be read.
#[derive(Debug)]
struct BrokenShard {
    inner: MemoryShard,
}

impl Shard for BrokenShard {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn num_docs(&self) -> u32 {
        self.inner.num_docs()
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.inner.fields()
    }

    fn int_terms(&self, field: &str) -> Result<Box<dyn TermCursor>> {
        Err(FtgsError::Io(io::Error::other(format!("unreadable field {field}"))))
    }

    fn string_terms(&self, field: &str) -> Result<Box<dyn TermCursor>> {
        self.inner.string_terms(field)
    }

    fn metric(&self, name: &str) -> Result<Arc<dyn IntValueLookup>> {
        self.inner.metric(name)
    }
}

#[test]
fn test_failed_shard_releases_every_resource() {
    let columns = random_columns(13, 4, 200);
    let mut shards: Vec<Arc<dyn Shard>> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| c.shard(&format!("shard-{i}")))
        .collect();
    let broken = MemoryShard::builder("broken", 2)
        .int_column("x", vec![1, 2])
        .string_column("c", ["red", "blue"])
        .build()
        .unwrap();
    shards.insert(2, Arc::new(BrokenShard { inner: broken }));

    let session = MultiSession::new(context(3), None, shards).unwrap();
    session.push_stat("count()").unwrap();
    let memory_before = session.memory_budget().used();
    let temp_before = session.temp_budget().remaining();

    let params = FtgsParams::new(vec![FieldSpec::string("c"), FieldSpec::int("x")]);
    let Err(err) = session.ftgs_iterator(&params) else {
        panic!("expected the broken shard to fail the request");
    };
    match err {
        FtgsError::TaskFailed { task, source } => {
            assert_eq!(task, "split-2");
            assert!(matches!(*source, FtgsError::Io(_)));
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(session.memory_budget().used(), memory_before);
    assert_eq!(session.temp_budget().remaining(), temp_before);

    // the session stays usable
    let mut colors = session
        .ftgs_iterator(&FtgsParams::new(vec![FieldSpec::string("c")]))
        .unwrap();
    assert_eq!(drain(&mut colors).unwrap().len(), COLORS.len());
}

#[test]
fn test_subset_over_shards() {
    let columns = random_columns(17, 2, 100);
    let session = regrouped_session(&columns, 2);
    let subset = ftgs::session::TermSubset::default()
        .with_string_terms("c", vec!["red".to_string(), "nope".to_string(), "blue".to_string()]);

    let actual = flatten(drain(&mut session.subset_ftgs_iterator(&subset).unwrap()).unwrap());
    let reference: Vec<_> = expected(&columns, group_of)
        .into_iter()
        .filter(|(field, term, _)| *field == 1 && (*term == Term::str("red") || *term == Term::str("blue")))
        .map(|(_, term, groups)| (0, term, groups))
        .collect();
    assert_eq!(actual, reference);
}

fn two_shard_session(small: usize, large: usize) -> MultiSession {
    let shards = [("small", small), ("large", large)]
        .into_iter()
        .map(|(name, docs)| {
            let mut builder = MemoryShard::builder(name, docs as u32)
                .int_column("x", (0..docs as i64).collect())
                .string_column("c", (0..docs).map(|i| COLORS[i % COLORS.len()]));
            if name == "large" {
                builder = builder.metric("only_large", vec![1; docs]);
            }
            Arc::new(builder.build().unwrap()) as Arc<dyn Shard>
        })
        .collect();
    MultiSession::new(context(2), None, shards).unwrap()
}

/// A merged query only works while every shard carries the same stats.
fn assert_stacks_agree(session: &MultiSession, depth: usize) {
    assert_eq!(session.num_stats().unwrap(), depth);
    let mut iterator = session
        .ftgs_iterator(&FtgsParams::new(vec![FieldSpec::string("c")]))
        .unwrap();
    let records = drain(&mut iterator).unwrap();
    assert_eq!(records.len(), COLORS.len());
    assert!(records.iter().all(|r| r.groups.num_stats() == depth));
}

#[test]
fn test_failed_push_on_missing_metric_keeps_stacks() {
    let session = two_shard_session(10, 50);
    session.push_stat("count()").unwrap();

    assert!(matches!(session.push_stat("only_large"), Err(FtgsError::NotFound(_))));
    assert_stacks_agree(&session, 1);
}

#[test]
fn test_stat_changes_under_memory_pressure_keep_stacks() {
    let session = two_shard_session(10, 10_000);
    session.push_stat("x").unwrap();
    let budget = session.memory_budget().clone();
    let used = budget.used();

    let hog = budget.claim(budget.available() - 100).unwrap();
    assert!(session.pop_stat().unwrap_err().is_out_of_memory());
    assert!(session.push_stat("count()").unwrap_err().is_out_of_memory());
    drop(hog);

    assert_eq!(budget.used(), used);
    assert_stacks_agree(&session, 1);
    assert_eq!(session.pop_stat().unwrap(), 0);
    assert_stacks_agree(&session, 0);
}
