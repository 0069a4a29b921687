//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cli::args::{FtgsArgs, OutputFormat};
use crate::error::Result;
use crate::ftgs::types::{FtgsRecord, Term};

/// Stats of one group for one term.
#[derive(Debug, Serialize, Deserialize)]
pub struct GroupOutput {
    pub group: u32,
    pub stats: Vec<i64>,
}

/// One FTGS record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordOutput {
    pub field: String,
    pub term: Value,
    pub groups: Vec<GroupOutput>,
}

impl RecordOutput {
    pub fn from_record(record: &FtgsRecord, field: &str) -> Self {
        let term = match &record.term {
            Term::Int(v) => Value::from(*v),
            Term::Str(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        };
        RecordOutput {
            field: field.to_string(),
            term,
            groups: record
                .groups
                .iter()
                .map(|(group, stats)| GroupOutput {
                    group,
                    stats: stats.to_vec(),
                })
                .collect(),
        }
    }
}

/// Result of the ftgs command.
#[derive(Debug, Serialize, Deserialize)]
pub struct FtgsResults {
    pub stats: Vec<String>,
    pub num_groups: u32,
    pub records: Vec<RecordOutput>,
    pub duration_ms: u64,
}

/// Result of the group-stats command.
#[derive(Debug, Serialize, Deserialize)]
pub struct GroupStatsResults {
    pub stat: String,
    /// Sum per group id; group 0 is omitted.
    pub groups: Vec<GroupOutput>,
}

/// Result of the distinct command.
#[derive(Debug, Serialize, Deserialize)]
pub struct DistinctResults {
    pub field: String,
    pub counts: Vec<(u32, i64)>,
}

/// Result of the regroup command.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegroupResults {
    pub num_groups: u32,
    pub group_sizes: Vec<(u32, i64)>,
    pub duration_ms: u64,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &FtgsArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

fn output_json<T: Serialize>(result: &T, args: &FtgsArgs) -> Result<()> {
    let text = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{text}");
    Ok(())
}

fn output_human<T: Serialize>(message: &str, result: &T, args: &FtgsArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }
    let value = serde_json::to_value(result)?;
    let Some(obj) = value.as_object() else {
        println!("{value}");
        return Ok(());
    };

    if let Some(records) = obj.get("records").and_then(|r| r.as_array()) {
        for record in records {
            let field = record.get("field").and_then(|f| f.as_str()).unwrap_or("?");
            let term = record.get("term").map(render).unwrap_or_default();
            println!("{field}:{term}");
            if let Some(groups) = record.get("groups").and_then(|g| g.as_array()) {
                for group in groups {
                    println!(
                        "  group {}: {}",
                        group.get("group").map(render).unwrap_or_default(),
                        group.get("stats").map(render).unwrap_or_default()
                    );
                }
            }
        }
    }
    for (key, value) in obj {
        if key != "records" {
            println!("{key}: {}", render(value));
        }
    }
    Ok(())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
