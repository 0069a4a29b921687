#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ftgs::config::EngineConfig;
use ftgs::ftgs::{FtgsRecord, Term};
use ftgs::session::EngineContext;
use ftgs::shard::{MemoryShard, Shard};

pub const COLORS: [&str; 5] = ["blue", "green", "orange", "red", "violet"];

/// Columns of one generated shard: int field `x` and string field `c`.
#[derive(Debug, Clone)]
pub struct ShardColumns {
    pub x: Vec<i64>,
    pub c: Vec<String>,
}

impl ShardColumns {
    pub fn shard(&self, name: &str) -> Arc<dyn Shard> {
        Arc::new(
            MemoryShard::builder(name, self.x.len() as u32)
                .int_column("x", self.x.clone())
                .string_column("c", self.c.clone())
                .build()
                .unwrap(),
        )
    }
}

pub fn context(splits: usize) -> Arc<EngineContext> {
    EngineContext::new(
        EngineConfig::default()
            .with_worker_threads(4)
            .with_cpu_slots(2)
            .with_merge_splits(splits),
    )
    .unwrap()
}

pub fn random_columns(seed: u64, shards: usize, docs: usize) -> Vec<ShardColumns> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..shards)
        .map(|_| ShardColumns {
            x: (0..docs).map(|_| rng.random_range(-20..60)).collect(),
            c: (0..docs)
                .map(|_| COLORS[rng.random_range(0..COLORS.len())].to_string())
                .collect(),
        })
        .collect()
}

/// A record flattened for comparison: field, term, `(group, stats)` pairs.
pub type Flat = (usize, Term, Vec<(u32, Vec<i64>)>);

pub fn flatten(records: Vec<FtgsRecord>) -> Vec<Flat> {
    records
        .into_iter()
        .map(|r| {
            let groups = r.groups.iter().map(|(g, s)| (g, s.to_vec())).collect();
            (r.field, r.term, groups)
        })
        .collect()
}

/// Reference aggregation over fields `[x, c]` with stats `[count(), x]`.
pub fn expected(columns: &[ShardColumns], group_of: impl Fn(i64, &str) -> u32) -> Vec<Flat> {
    let mut table: BTreeMap<(usize, Term), BTreeMap<u32, Vec<i64>>> = BTreeMap::new();
    for shard in columns {
        for (&x, c) in shard.x.iter().zip(&shard.c) {
            let group = group_of(x, c);
            if group == 0 {
                continue;
            }
            for key in [(0, Term::Int(x)), (1, Term::str(c))] {
                let stats = table
                    .entry(key)
                    .or_default()
                    .entry(group)
                    .or_insert_with(|| vec![0, 0]);
                stats[0] += 1;
                stats[1] += x;
            }
        }
    }
    table
        .into_iter()
        .map(|((field, term), groups)| (field, term, groups.into_iter().collect()))
        .collect()
}
