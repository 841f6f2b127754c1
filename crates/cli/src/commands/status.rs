//! Run progress command

use anyhow::Result;
use chrono::Local;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tracing::debug;
use webbench_common::{BenchConfig, ProgressStore, ResumeInfo, RunStatus};

use super::Context;
use crate::output::{print_item, print_list, print_warning, TableDisplay};

#[derive(Args)]
pub struct StatusArgs {
    /// Results date to inspect (defaults to today)
    #[arg(long)]
    pub date: Option<String>,
}

impl TableDisplay for ResumeInfo {
    fn headers() -> Vec<&'static str> {
        vec![
            "Run ID",
            "Status",
            "Progress",
            "Last Test",
            "Failed",
            "Results Dir",
        ]
    }

    fn row(&self) -> Vec<String> {
        let status = match self.status {
            RunStatus::Completed => self.status.to_string().green().to_string(),
            RunStatus::Running => self.status.to_string().yellow().to_string(),
        };
        let last = if self.last_framework.is_empty() {
            "-".to_string()
        } else {
            format!(
                "{} - {} (Batch {}, retry {})",
                self.last_framework, self.last_scenario, self.last_batch, self.last_retry
            )
        };
        vec![
            self.run_id.clone(),
            status,
            format!("{}/{}", self.completed_tests.len(), self.total_tests),
            last,
            self.failed_tests.len().to_string(),
            self.results_dir.display().to_string(),
        ]
    }
}

/// A failed test entry split into its key and error
#[derive(Debug, PartialEq, Serialize)]
pub struct FailedTest {
    pub test: String,
    pub error: String,
}

impl FailedTest {
    fn parse(entry: &str) -> Self {
        match entry.split_once(": ") {
            Some((test, error)) => Self {
                test: test.to_string(),
                error: error.to_string(),
            },
            None => Self {
                test: entry.to_string(),
                error: String::new(),
            },
        }
    }
}

impl TableDisplay for FailedTest {
    fn headers() -> Vec<&'static str> {
        vec!["Failed Test", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.test.clone(), self.error.red().to_string()]
    }
}

pub fn execute(args: StatusArgs, ctx: &Context) -> Result<()> {
    let config = if ctx.config.exists() {
        ctx.load_config()?
    } else {
        debug!("No configuration at {}, using defaults", ctx.config.display());
        BenchConfig::default()
    };
    let root = ctx
        .results_dir
        .clone()
        .unwrap_or_else(|| config.output.results_dir.clone());

    let dir = match &args.date {
        Some(date) => root.join(date),
        None => {
            let mut config = config;
            config.output.results_dir = root;
            config.dated_results_dir(Local::now())
        }
    };

    match ProgressStore::new(&dir).resume_info()? {
        Some(info) => {
            print_item(&info, ctx.format);
            let failed: Vec<FailedTest> = info
                .failed_tests
                .iter()
                .map(|f| FailedTest::parse(f))
                .collect();
            print_list(&failed, ctx.format);
        }
        None => print_warning(&format!("No run state found in {}", dir.display())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_test_parse() {
        assert_eq!(
            FailedTest::parse("Gin_Simple GET_2: test failed after 3 retries: exit status 1"),
            FailedTest {
                test: "Gin_Simple GET_2".into(),
                error: "test failed after 3 retries: exit status 1".into(),
            }
        );
        assert_eq!(FailedTest::parse("odd").error, "");
    }

    #[test]
    fn test_resume_info_row() {
        let info = ResumeInfo {
            run_id: "run_20250825_100000".into(),
            status: RunStatus::Running,
            last_framework: "Gin".into(),
            last_scenario: "Simple GET".into(),
            last_batch: 2,
            last_retry: 1,
            completed_tests: vec!["Gin_Simple GET_1".into(), "Gin_Simple GET_2".into()],
            failed_tests: vec![],
            total_tests: 8,
            results_dir: "results/2025-08-25".into(),
        };
        let row = info.row();
        assert_eq!(row.len(), ResumeInfo::headers().len());
        assert_eq!(row[2], "2/8");
        assert_eq!(row[3], "Gin - Simple GET (Batch 2, retry 1)");
    }
}
