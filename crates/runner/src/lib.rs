//! WebBench test runner
//!
//! Executes the framework × scenario × batch matrix with an external load
//! tool, retries transient failures, restarts frameworks through the
//! supervisor, persists progress for resume and writes the result artifacts.

pub mod control;
pub mod error;
pub mod executor;
pub mod limits;
pub mod orchestrator;
pub mod parse;
pub mod report;
pub mod retry;
pub mod tool;

#[cfg(test)]
mod testing;

pub use control::TargetControl;
pub use error::{AttemptError, AttemptKind, Result, RunError};
pub use executor::{Executor, ExecutorSettings, MatrixOutcome};
pub use limits::{FileDescriptorLimit, LimitAdjuster};
pub use orchestrator::{Orchestrator, RunSummary};
pub use report::{MarkdownReport, ReportGenerator};
pub use retry::RetryClassifier;
pub use tool::{ExternalLoadTool, LoadTool, ToolRun};
