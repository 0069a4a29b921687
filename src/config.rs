//! Engine and request configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FtgsError, Result};
use crate::ftgs::types::FieldSpec;

/// Process-wide engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size. If None, uses the number of CPU cores.
    pub worker_threads: Option<usize>,

    /// Concurrent CPU-heavy sections allowed by the scheduler.
    pub cpu_slots: usize,

    /// Buckets used by the parallel split-and-merge step.
    /// If None, uses half the CPU cores (at least one).
    pub merge_splits: Option<usize>,

    /// Memory budget of one multi-session in bytes.
    pub memory_limit: u64,

    /// Spill budget of one multi-session in bytes.
    pub temp_space_limit: u64,

    /// Documents scanned between two scheduler checkpoints.
    pub yield_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            cpu_slots: num_cpus::get(),
            merge_splits: None,
            memory_limit: 1024 * 1024 * 1024, // 1GB
            temp_space_limit: 16 * 1024 * 1024 * 1024, // 16GB
            yield_interval: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file; missing keys take defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(FtgsError::invalid_argument("worker_threads must be positive"));
        }
        if self.merge_splits == Some(0) {
            return Err(FtgsError::invalid_argument("merge_splits must be positive"));
        }
        if self.yield_interval == 0 {
            return Err(FtgsError::invalid_argument("yield_interval must be positive"));
        }
        Ok(())
    }

    /// Effective worker pool size.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Effective number of merge buckets.
    pub fn merge_splits(&self) -> usize {
        self.merge_splits.unwrap_or_else(|| num_cpus::get() / 2).max(1)
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_cpu_slots(mut self, slots: usize) -> Self {
        self.cpu_slots = slots;
        self
    }

    pub fn with_merge_splits(mut self, splits: usize) -> Self {
        self.merge_splits = Some(splits);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_temp_space_limit(mut self, bytes: u64) -> Self {
        self.temp_space_limit = bytes;
        self
    }

    pub fn with_yield_interval(mut self, docs: u64) -> Self {
        self.yield_interval = docs;
        self
    }
}

/// What an FTGS request reads and how the result is shaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtgsParams {
    pub fields: Vec<FieldSpec>,

    /// Terms kept per field; 0 keeps every term.
    #[serde(default)]
    pub term_limit: usize,

    /// Rank terms on this stat and keep the top `term_limit` of them.
    #[serde(default)]
    pub sort_stat: Option<usize>,

    #[serde(default = "default_true")]
    pub sorted: bool,

    /// Whether records carry the session's stats. Distinct counting turns
    /// them off.
    #[serde(default = "default_true")]
    pub with_stats: bool,
}

fn default_true() -> bool {
    true
}

impl FtgsParams {
    /// Sorted, unlimited request over `fields`.
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        FtgsParams {
            fields,
            term_limit: 0,
            sort_stat: None,
            sorted: true,
            with_stats: true,
        }
    }

    /// Keep the first `limit` terms of each field.
    pub fn with_term_limit(mut self, limit: usize) -> Self {
        self.term_limit = limit;
        self
    }

    /// Keep the `limit` terms of each field ranking highest on `stat`.
    pub fn with_top_terms(mut self, limit: usize, stat: usize) -> Self {
        self.term_limit = limit;
        self.sort_stat = Some(stat);
        self
    }

    pub fn with_sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    pub fn without_stats(mut self) -> Self {
        self.with_stats = false;
        self
    }

    /// Whether this is a top-terms request.
    pub fn is_top_terms(&self) -> bool {
        self.term_limit > 0 && self.sort_stat.is_some()
    }

    /// Copy suitable for partial streams that are merged afterwards:
    /// sorted, and unlimited for top-terms requests since ranking needs
    /// every term.
    pub fn partial(&self) -> Self {
        let mut copy = self.clone();
        copy.sorted = true;
        if copy.is_top_terms() {
            copy.term_limit = 0;
            copy.sort_stat = None;
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.worker_threads() >= 1);
        assert!(config.merge_splits() >= 1);
        assert_eq!(config.with_merge_splits(3).merge_splits(), 3);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"cpu_slots": 2, "memory_limit": 4096}}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cpu_slots, 2);
        assert_eq!(config.memory_limit, 4096);
        assert_eq!(config.yield_interval, EngineConfig::default().yield_interval);

        let mut bad = NamedTempFile::new().unwrap();
        write!(bad, r#"{{"merge_splits": 0}}"#).unwrap();
        assert!(EngineConfig::from_json_file(bad.path()).is_err());
    }

    #[test]
    fn test_partial_params() {
        let params = FtgsParams::new(vec![FieldSpec::int("a")])
            .with_top_terms(5, 0)
            .with_sorted(false);
        assert!(params.is_top_terms());
        let partial = params.partial();
        assert!(partial.sorted);
        assert_eq!(partial.term_limit, 0);
        assert!(!partial.is_top_terms());

        let limited = FtgsParams::new(vec![]).with_term_limit(3);
        assert_eq!(limited.partial().term_limit, 3);
    }
}
