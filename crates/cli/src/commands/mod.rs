//! CLI Commands

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use webbench_common::BenchConfig;

use crate::output::OutputFormat;

pub mod run;
pub mod status;

/// Global options shared by every command
pub struct Context {
    pub config: PathBuf,
    pub results_dir: Option<PathBuf>,
    pub format: OutputFormat,
}

impl Context {
    pub fn load_config(&self) -> Result<BenchConfig> {
        BenchConfig::load(&self.config)
            .with_context(|| format!("failed to load configuration from {}", self.config.display()))
    }
}
