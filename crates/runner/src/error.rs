//! Error types for test execution and orchestration

use std::fmt;
use thiserror::Error;
use webbench_supervisor::SupervisorError;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunError>;

/// Errors that abort a cell or a whole run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("framework {framework} unavailable after {restarts} restart attempts: {source}")]
    TargetUnavailable {
        framework: String,
        restarts: u32,
        source: SupervisorError,
    },

    #[error("test failed after {retries} retries and {restarts} framework restarts: {reason}")]
    RetriesExhausted {
        retries: u32,
        restarts: u32,
        reason: String,
    },

    #[error("test failed for {framework} - {scenario} (Batch {batch}): {source}")]
    Cell {
        framework: String,
        scenario: String,
        batch: u32,
        source: Box<RunError>,
    },

    #[error("failed to start frameworks: {0}")]
    Startup(#[source] SupervisorError),

    #[error("frameworks failed health check: {0}")]
    Health(#[source] SupervisorError),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] webbench_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl RunError {
    /// True when the error, or the cell failure it wraps, came from cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            RunError::Cancelled => true,
            RunError::Cell { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// What went wrong with a single load-test attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// Tool could not be started
    Spawn,
    /// Tool exited unsuccessfully
    Exit,
    /// Tool exceeded its deadline
    Timeout,
    /// Attempt was cancelled by the caller
    Cancelled,
    Io,
}

/// Failure of one attempt. The message carries the tool output so retry
/// classification can match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: AttemptKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: AttemptKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AttemptError {}
