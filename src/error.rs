//! Error types for the FTGS engine.
//!
//! All fallible operations return [`FtgsError`] through the crate-wide
//! [`Result`] alias. Out-of-memory and temp-space errors are recoverable by
//! the caller: the failing operation is aborted but the session stays usable.
//!
//! # Examples
//!
//! ```
//! use ftgs::error::{FtgsError, Result};
//!
//! fn check_split(index: usize, count: usize) -> Result<()> {
//!     if index >= count {
//!         return Err(FtgsError::invalid_argument("split index out of range"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_split(3, 2).is_err());
//! ```

use std::io;

use thiserror::Error;

use crate::remote::RemoteError;

/// The main error type for FTGS operations.
#[derive(Error, Debug)]
pub enum FtgsError {
    /// I/O errors (spill files, remote streams).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The session memory budget cannot satisfy a claim.
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// The temp spill budget is exhausted.
    #[error("Temp space exhausted: {0}")]
    TempSpaceExhausted(String),

    /// A component was used against its contract (reused after close, set
    /// on an uncleared bit tree, ...).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Two remap conditions matched the same document while collisions
    /// were requested to fail.
    #[error("Regroup rule collision on doc {doc}: {message}")]
    RuleCollision { doc: u32, message: String },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown field, stat or session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Split fetch or remote command failure.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Malformed serialized FTGS stream.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A per-shard or per-bucket task failed; wraps the first failure.
    #[error("Task {task} failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<FtgsError>,
    },

    /// Worker pool construction failure.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with FtgsError.
pub type Result<T> = std::result::Result<T, FtgsError>;

impl FtgsError {
    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        FtgsError::IllegalState(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        FtgsError::InvalidArgument(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        FtgsError::NotFound(msg.into())
    }

    /// Create a new codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        FtgsError::Codec(msg.into())
    }

    /// Create a new temp space error.
    pub fn temp_space<S: Into<String>>(msg: S) -> Self {
        FtgsError::TempSpaceExhausted(msg.into())
    }

    /// Wrap a task failure.
    pub fn task_failed<S: Into<String>>(task: S, source: FtgsError) -> Self {
        FtgsError::TaskFailed {
            task: task.into(),
            source: Box::new(source),
        }
    }

    /// Whether the caller may retry with a smaller request.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            FtgsError::OutOfMemory { .. } | FtgsError::TempSpaceExhausted(_) => true,
            FtgsError::TaskFailed { source, .. } => source.is_out_of_memory(),
            FtgsError::Remote(e) => e.is_out_of_memory(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = FtgsError::illegal_state("bit tree not cleared");
        assert_eq!(error.to_string(), "Illegal state: bit tree not cleared");

        let error = FtgsError::OutOfMemory {
            requested: 100,
            available: 10,
        };
        assert_eq!(
            error.to_string(),
            "Out of memory: requested 100 bytes, 10 available"
        );
    }

    #[test]
    fn test_task_failed_keeps_source() {
        let inner = FtgsError::OutOfMemory {
            requested: 8,
            available: 0,
        };
        let error = FtgsError::task_failed("shard-3", inner);
        assert!(error.is_out_of_memory());
        assert!(error.to_string().starts_with("Task shard-3 failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = FtgsError::from(io_error);

        match error {
            FtgsError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }
}
