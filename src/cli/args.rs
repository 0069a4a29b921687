//! Command line argument parsing for the ftgs CLI using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// ftgs - run FTGS aggregations over columnar shards
#[derive(Parser, Debug, Clone)]
#[command(name = "ftgs")]
#[command(about = "Field/term/group/stat aggregation over columnar shards")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct FtgsArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, env = "FTGS_CONFIG", value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl FtgsArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream per-term, per-group stats
    Ftgs(FtgsCommandArgs),

    /// Sum one stat per group
    #[command(name = "group-stats")]
    GroupStats(GroupStatsArgs),

    /// Count distinct terms of a field per group
    Distinct(DistinctArgs),

    /// Apply remap rules and report group sizes
    Regroup(RegroupArgs),
}

/// Shards to open and an optional regroup applied before the command.
#[derive(Args, Debug, Clone)]
pub struct ShardArgs {
    /// Shard files (JSON)
    #[arg(value_name = "SHARD_FILE", required = true)]
    pub shards: Vec<PathBuf>,

    /// Remap rules file (JSON array) applied after opening the shards
    #[arg(long, value_name = "RULES_FILE")]
    pub rules: Option<PathBuf>,
}

/// Arguments for the ftgs command
#[derive(Args, Debug, Clone)]
pub struct FtgsCommandArgs {
    #[command(flatten)]
    pub input: ShardArgs,

    /// Int fields to iterate
    #[arg(long = "int-field", value_name = "FIELD")]
    pub int_fields: Vec<String>,

    /// String fields to iterate
    #[arg(long = "string-field", value_name = "FIELD")]
    pub string_fields: Vec<String>,

    /// Metrics pushed as stats, in order
    #[arg(short, long = "stat", value_name = "METRIC")]
    pub stats: Vec<String>,

    /// Terms kept per field (0 keeps all)
    #[arg(short = 'l', long, default_value = "0")]
    pub term_limit: usize,

    /// Keep the terms ranking highest on this stat index
    #[arg(long, value_name = "STAT_INDEX")]
    pub sort_stat: Option<usize>,

    /// Allow terms in any order
    #[arg(long)]
    pub unsorted: bool,
}

/// Arguments for group stats
#[derive(Args, Debug, Clone)]
pub struct GroupStatsArgs {
    #[command(flatten)]
    pub input: ShardArgs,

    /// Metric to sum
    #[arg(short, long, default_value = "count()")]
    pub stat: String,
}

/// Arguments for distinct counting
#[derive(Args, Debug, Clone)]
pub struct DistinctArgs {
    #[command(flatten)]
    pub input: ShardArgs,

    /// Field whose terms are counted
    #[arg(value_name = "FIELD")]
    pub field: String,

    /// Treat the field as int-valued
    #[arg(long)]
    pub int: bool,
}

/// Arguments for regrouping
#[derive(Args, Debug, Clone)]
pub struct RegroupArgs {
    #[command(flatten)]
    pub input: ShardArgs,

    /// Fail when two conditions match the same document
    #[arg(long)]
    pub error_on_collision: bool,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ftgs_command() {
        let args = FtgsArgs::parse_from([
            "ftgs",
            "-vv",
            "ftgs",
            "a.json",
            "b.json",
            "--string-field",
            "country",
            "--stat",
            "count()",
            "--term-limit",
            "5",
        ]);
        assert_eq!(args.verbosity(), 2);
        let Command::Ftgs(cmd) = args.command else {
            panic!("expected ftgs command");
        };
        assert_eq!(cmd.input.shards.len(), 2);
        assert_eq!(cmd.string_fields, vec!["country".to_string()]);
        assert_eq!(cmd.term_limit, 5);
        assert!(!cmd.unsorted);
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        let args = FtgsArgs::parse_from(["ftgs", "-q", "-vvv", "group-stats", "a.json"]);
        assert_eq!(args.verbosity(), 0);
        let Command::GroupStats(cmd) = args.command else {
            panic!("expected group-stats command");
        };
        assert_eq!(cmd.stat, "count()");
    }
}
