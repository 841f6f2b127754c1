//! WebBench Common Library
//!
//! Shared types, configuration and durable run state for the WebBench harness.

pub mod config;
pub mod error;
pub mod progress;
pub mod types;

// Re-export commonly used types
pub use config::{BenchConfig, ConfigOverrides, FrameworkConfig, ScenarioConfig};
pub use error::{Error, Result};
pub use progress::{ProgressSnapshot, ProgressStore, ResumeInfo};
pub use types::*;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
