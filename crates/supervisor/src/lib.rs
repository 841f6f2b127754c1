//! WebBench process supervisor
//!
//! Keeps each framework server under test alive as a child process: launches
//! it in its own process group, watches for exits, restarts it with
//! exponential backoff, probes its `/ping` endpoint, and stops it with
//! SIGTERM followed by SIGKILL.

pub mod error;
pub mod health;
mod monitor;
pub mod policy;
pub mod process;
pub mod supervisor;
pub mod target;

pub use error::{Result, SupervisorError};
pub use health::{HealthProbe, HttpHealthProbe};
pub use policy::{RestartPolicy, SupervisorSettings};
pub use supervisor::Supervisor;
pub use target::{TargetSpec, TargetState, TargetStatus};
