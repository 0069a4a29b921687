//! Contract with the remote session transport.
//!
//! The engine never frames bytes itself: a [`RemoteTransport`] fetches split
//! streams (in the codec of [`crate::ftgs::codec`]) and executes commands on
//! the multi-session a node holds under a session id. Failures are either
//! known, carrying a structured reason, or plain I/O. Nothing here retries.

pub mod loopback;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{FtgsError, Result};
use crate::ftgs::types::FieldSpec;
use crate::regroup::GroupMultiRemapRule;
use crate::session::MultiSession;

pub use loopback::LoopbackTransport;

/// Reason attached to a known remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnownErrorKind {
    SessionNotFound,
    OutOfMemory,
    InvalidRequest,
    Other,
}

impl fmt::Display for KnownErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KnownErrorKind::SessionNotFound => "session not found",
            KnownErrorKind::OutOfMemory => "out of memory",
            KnownErrorKind::InvalidRequest => "invalid request",
            KnownErrorKind::Other => "remote failure",
        };
        f.write_str(name)
    }
}

/// Failure reported by a transport.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote side answered with a classified error.
    #[error("{kind}: {message}")]
    Known { kind: KnownErrorKind, message: String },

    /// The exchange itself failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RemoteError {
    pub fn known<S: Into<String>>(kind: KnownErrorKind, message: S) -> Self {
        RemoteError::Known {
            kind,
            message: message.into(),
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            RemoteError::Known {
                kind: KnownErrorKind::OutOfMemory,
                ..
            }
        )
    }
}

impl From<FtgsError> for RemoteError {
    /// Classify a local failure the way a serving node reports it.
    fn from(error: FtgsError) -> Self {
        match error {
            FtgsError::Io(e) => RemoteError::Io(e),
            FtgsError::Remote(e) => e,
            error => {
                let kind = if error.is_out_of_memory() {
                    KnownErrorKind::OutOfMemory
                } else if matches!(
                    error,
                    FtgsError::InvalidArgument(_) | FtgsError::RuleCollision { .. }
                ) {
                    KnownErrorKind::InvalidRequest
                } else {
                    KnownErrorKind::Other
                };
                RemoteError::known(kind, error.to_string())
            }
        }
    }
}

/// Request for bucket `split_index` of a node's FTGS stream split into
/// `num_splits` buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitRequest {
    pub fields: Vec<FieldSpec>,
    pub split_index: usize,
    pub num_splits: usize,
    /// Terms kept per field of the bucket; 0 keeps every term.
    #[serde(default)]
    pub term_limit: usize,
    #[serde(default = "default_with_stats")]
    pub with_stats: bool,
}

fn default_with_stats() -> bool {
    true
}

/// A session command that can run on every node of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteCommand {
    Regroup {
        rules: Vec<GroupMultiRemapRule>,
        error_on_collision: bool,
    },
    RandomMetricRegroup {
        metric: String,
        salt: String,
        p: f64,
        target_group: u32,
        negative_group: u32,
        positive_group: u32,
    },
    PushStat {
        metric: String,
    },
    PopStat,
    GroupStats {
        stat: usize,
    },
    NumGroups,
}

/// Result of a [`RemoteCommand`] on one node, or combined over many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommandResponse {
    NumGroups(u32),
    NumStats(usize),
    GroupStats(Vec<i64>),
}

impl RemoteCommand {
    /// Run the command on a local multi-session.
    pub fn apply(&self, session: &MultiSession) -> Result<CommandResponse> {
        match self {
            RemoteCommand::Regroup {
                rules,
                error_on_collision,
            } => Ok(CommandResponse::NumGroups(
                session.regroup(rules, *error_on_collision)?,
            )),
            RemoteCommand::RandomMetricRegroup {
                metric,
                salt,
                p,
                target_group,
                negative_group,
                positive_group,
            } => Ok(CommandResponse::NumGroups(session.random_metric_regroup(
                metric,
                salt,
                *p,
                *target_group,
                *negative_group,
                *positive_group,
            )?)),
            RemoteCommand::PushStat { metric } => {
                Ok(CommandResponse::NumStats(session.push_stat(metric)?))
            }
            RemoteCommand::PopStat => Ok(CommandResponse::NumStats(session.pop_stat()?)),
            RemoteCommand::GroupStats { stat } => {
                Ok(CommandResponse::GroupStats(session.group_stats(*stat)?))
            }
            RemoteCommand::NumGroups => Ok(CommandResponse::NumGroups(session.num_groups()?)),
        }
    }

    /// Fold per-node responses: group counts take the maximum, group stats
    /// are summed, stat counts must agree.
    pub fn combine(&self, responses: Vec<CommandResponse>) -> Result<CommandResponse> {
        let mut responses = responses.into_iter();
        let Some(first) = responses.next() else {
            return Err(FtgsError::invalid_argument("no responses to combine"));
        };
        responses.try_fold(first, |acc, next| match (acc, next) {
            (CommandResponse::NumGroups(a), CommandResponse::NumGroups(b)) => {
                Ok(CommandResponse::NumGroups(a.max(b)))
            }
            (CommandResponse::NumStats(a), CommandResponse::NumStats(b)) if a == b => {
                Ok(CommandResponse::NumStats(a))
            }
            (CommandResponse::GroupStats(mut a), CommandResponse::GroupStats(b)) => {
                if a.len() < b.len() {
                    a.resize(b.len(), 0);
                }
                for (total, value) in a.iter_mut().zip(b) {
                    *total += value;
                }
                Ok(CommandResponse::GroupStats(a))
            }
            (a, b) => Err(FtgsError::illegal_state(format!(
                "cannot combine {a:?} with {b:?}"
            ))),
        })
    }
}

/// Transport to the multi-sessions held by other nodes.
pub trait RemoteTransport: Send + Sync {
    /// Open the encoded FTGS stream of one split bucket.
    fn fetch_split(
        &self,
        node: &str,
        session_id: &str,
        request: &SplitRequest,
    ) -> std::result::Result<Box<dyn Read + Send>, RemoteError>;

    /// Run `command` on the node's session.
    fn execute(
        &self,
        node: &str,
        session_id: &str,
        command: &RemoteCommand,
    ) -> std::result::Result<CommandResponse, RemoteError>;
}

/// The sessions of one query across a set of nodes.
#[derive(Clone)]
pub struct RemoteSessionGroup {
    session_id: String,
    nodes: Vec<String>,
    transport: Arc<dyn RemoteTransport>,
}

impl fmt::Debug for RemoteSessionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSessionGroup")
            .field("session_id", &self.session_id)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl RemoteSessionGroup {
    pub fn new<S: Into<String>>(
        session_id: S,
        nodes: Vec<String>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        RemoteSessionGroup {
            session_id: session_id.into(),
            nodes,
            transport,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Send `command` to every node and combine the answers. The first
    /// failing node fails the whole call.
    pub fn execute(&self, command: &RemoteCommand) -> Result<CommandResponse> {
        if self.nodes.is_empty() {
            return Err(FtgsError::invalid_argument("session group has no nodes"));
        }
        let responses = self
            .nodes
            .par_iter()
            .map(|node| {
                self.transport
                    .execute(node, &self.session_id, command)
                    .map_err(|e| FtgsError::task_failed(node.clone(), FtgsError::Remote(e)))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Command ran on {} nodes of session {}", responses.len(), self.session_id);
        command.combine(responses)
    }

    /// Regroup every node; returns the largest resulting group count.
    pub fn regroup(&self, rules: Vec<GroupMultiRemapRule>, error_on_collision: bool) -> Result<u32> {
        match self.execute(&RemoteCommand::Regroup {
            rules,
            error_on_collision,
        })? {
            CommandResponse::NumGroups(n) => Ok(n),
            other => Err(FtgsError::illegal_state(format!(
                "unexpected regroup response {other:?}"
            ))),
        }
    }

    /// Summed group stats of `stat` over every node.
    pub fn group_stats(&self, stat: usize) -> Result<Vec<i64>> {
        match self.execute(&RemoteCommand::GroupStats { stat })? {
            CommandResponse::GroupStats(stats) => Ok(stats),
            other => Err(FtgsError::illegal_state(format!(
                "unexpected group stats response {other:?}"
            ))),
        }
    }
}
