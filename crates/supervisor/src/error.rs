//! Error types for process supervision

use std::time::Duration;
use thiserror::Error;

use crate::target::TargetState;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Target {0} not found")]
    TargetNotFound(String),

    #[error("Binary for {name} not found: {path}")]
    BinaryNotFound { name: String, path: String },

    #[error("Target {name} is already {state}")]
    AlreadyActive { name: String, state: TargetState },

    #[error("Failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Target {name} not healthy after {attempts} health checks")]
    HealthCheck { name: String, attempts: u32 },

    #[error("Target {name} still restarting after {waited:?}")]
    RestartTimeout { name: String, waited: Duration },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{} target operation(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<SupervisorError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn join_errors(errors: &[SupervisorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SupervisorError {
    /// Collapse a list of per-target errors, `Ok` when empty
    pub fn aggregate(mut errors: Vec<SupervisorError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SupervisorError::Aggregate(errors)),
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
