//! Command implementations for the ftgs CLI.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::{EngineConfig, FtgsParams};
use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::FtgsIterator;
use crate::ftgs::types::FieldSpec;
use crate::regroup::GroupMultiRemapRule;
use crate::session::{EngineContext, MultiSession};
use crate::shard::{COUNT_METRIC, MemoryShard, Shard};

/// Execute a CLI command.
pub fn execute_command(args: FtgsArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let context = EngineContext::new(config)?;

    match &args.command {
        Command::Ftgs(cmd) => run_ftgs(cmd, &context, &args),
        Command::GroupStats(cmd) => run_group_stats(cmd, &context, &args),
        Command::Distinct(cmd) => run_distinct(cmd, &context, &args),
        Command::Regroup(cmd) => run_regroup(cmd, &context, &args),
    }
}

/// Open every shard file into one session and apply the rules file, if any.
fn open_session(input: &ShardArgs, context: &Arc<EngineContext>, error_on_collision: bool) -> Result<MultiSession> {
    let shards = input
        .shards
        .iter()
        .map(|path| MemoryShard::from_json_file(path).map(|s| Arc::new(s) as Arc<dyn Shard>))
        .collect::<Result<Vec<_>>>()?;
    let session = MultiSession::new(Arc::clone(context), None, shards)?;

    if let Some(path) = &input.rules {
        let rules = load_rules(path)?;
        let num_groups = session.regroup(&rules, error_on_collision)?;
        info!("Applied {} rules from {}: {num_groups} groups", rules.len(), path.display());
    }
    Ok(session)
}

fn load_rules(path: &Path) -> Result<Vec<GroupMultiRemapRule>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Pairs `(group, value)` for every group but 0.
fn by_group(values: Vec<i64>) -> Vec<(u32, i64)> {
    values
        .into_iter()
        .enumerate()
        .skip(1)
        .map(|(group, value)| (group as u32, value))
        .collect()
}

fn run_ftgs(cmd: &FtgsCommandArgs, context: &Arc<EngineContext>, cli_args: &FtgsArgs) -> Result<()> {
    let fields: Vec<FieldSpec> = cmd
        .int_fields
        .iter()
        .map(FieldSpec::int)
        .chain(cmd.string_fields.iter().map(FieldSpec::string))
        .collect();
    if fields.is_empty() {
        return Err(FtgsError::invalid_argument(
            "at least one --int-field or --string-field is required",
        ));
    }

    let start = Instant::now();
    let session = open_session(&cmd.input, context, false)?;
    for stat in &cmd.stats {
        session.push_stat(stat)?;
    }

    let mut params = FtgsParams::new(fields).with_sorted(!cmd.unsorted);
    params = match cmd.sort_stat {
        Some(stat) => params.with_top_terms(cmd.term_limit, stat),
        None => params.with_term_limit(cmd.term_limit),
    };

    let mut iterator = session.ftgs_iterator(&params)?;
    let num_groups = iterator.num_groups();
    let names: Vec<String> = iterator.fields().iter().map(|f| f.name.clone()).collect();
    let mut records = Vec::new();
    while let Some(record) = iterator.next_record()? {
        let name = names.get(record.field).map(String::as_str).unwrap_or("?");
        records.push(RecordOutput::from_record(&record, name));
    }
    iterator.close();
    session.close();

    output_result(
        "FTGS results",
        &FtgsResults {
            stats: cmd.stats.clone(),
            num_groups,
            records,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        cli_args,
    )
}

fn run_group_stats(cmd: &GroupStatsArgs, context: &Arc<EngineContext>, cli_args: &FtgsArgs) -> Result<()> {
    let session = open_session(&cmd.input, context, false)?;
    let depth = session.push_stat(&cmd.stat)?;
    let totals = session.group_stats(depth - 1)?;
    session.close();

    output_result(
        "Group stats",
        &GroupStatsResults {
            stat: cmd.stat.clone(),
            groups: by_group(totals)
                .into_iter()
                .map(|(group, value)| GroupOutput {
                    group,
                    stats: vec![value],
                })
                .collect(),
        },
        cli_args,
    )
}

fn run_distinct(cmd: &DistinctArgs, context: &Arc<EngineContext>, cli_args: &FtgsArgs) -> Result<()> {
    let session = open_session(&cmd.input, context, false)?;
    let counts = session.distinct(&cmd.field, cmd.int)?;
    session.close();

    output_result(
        "Distinct terms per group",
        &DistinctResults {
            field: cmd.field.clone(),
            counts: by_group(counts),
        },
        cli_args,
    )
}

fn run_regroup(cmd: &RegroupArgs, context: &Arc<EngineContext>, cli_args: &FtgsArgs) -> Result<()> {
    if cmd.input.rules.is_none() {
        return Err(FtgsError::invalid_argument("regroup needs --rules"));
    }
    let start = Instant::now();
    let session = open_session(&cmd.input, context, cmd.error_on_collision)?;
    let num_groups = session.num_groups()?;
    let depth = session.push_stat(COUNT_METRIC)?;
    let sizes = session.group_stats(depth - 1)?;
    session.close();

    output_result(
        "Regroup complete",
        &RegroupResults {
            num_groups,
            group_sizes: by_group(sizes),
            duration_ms: start.elapsed().as_millis() as u64,
        },
        cli_args,
    )
}
