//! Benchmark run command

use anyhow::Result;
use chrono::Local;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use webbench_common::{ConfigOverrides, RunStatus, ToolKind};
use webbench_runner::{
    ExternalLoadTool, FileDescriptorLimit, MarkdownReport, Orchestrator, RunSummary,
};
use webbench_supervisor::Supervisor;

use super::Context;
use crate::output::{print_error, print_info, print_item, print_success, print_warning, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Requests per test (required for ab)
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,

    /// Concurrent connections
    #[arg(short, long)]
    pub connections: Option<u32>,

    /// Test duration, e.g. 30s
    #[arg(short, long)]
    pub duration: Option<String>,

    /// Load tool (wrk or ab)
    #[arg(short, long)]
    pub tool: Option<ToolKind>,

    /// Batches per framework and scenario
    #[arg(short, long)]
    pub batches: Option<u32>,

    /// Retries per test
    #[arg(long)]
    pub retries: Option<u32>,

    /// Only run these frameworks (config keys, comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub frameworks: Vec<String>,

    /// Only run these scenarios (config keys, comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub scenarios: Vec<String>,

    /// Skip README generation
    #[arg(long)]
    pub no_report: bool,
}

impl RunArgs {
    pub fn overrides(&self, results_dir: Option<PathBuf>) -> ConfigOverrides {
        ConfigOverrides {
            requests: self.requests,
            connections: self.connections,
            duration: self.duration.clone(),
            tool: self.tool,
            batches: self.batches,
            retries: self.retries,
            results_dir,
            frameworks: self.frameworks.clone(),
            scenarios: self.scenarios.clone(),
        }
    }
}

impl TableDisplay for RunSummary {
    fn headers() -> Vec<&'static str> {
        vec![
            "Run ID", "Status", "Executed", "Skipped", "Results", "Duration", "Results Dir",
        ]
    }

    fn row(&self) -> Vec<String> {
        let status = match self.status {
            RunStatus::Completed => self.status.to_string().green().to_string(),
            RunStatus::Running => self.status.to_string().yellow().to_string(),
        };
        let elapsed = (self.finished_at - self.started_at).num_seconds().max(0);
        vec![
            self.run_id.clone(),
            status,
            self.executed.to_string(),
            self.skipped.to_string(),
            self.total_results.to_string(),
            format!("{}m{:02}s", elapsed / 60, elapsed % 60),
            self.results_dir.display().to_string(),
        ]
    }
}

pub async fn execute(args: RunArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.load_config()?;
    args.overrides(ctx.results_dir.clone()).apply(&mut config)?;

    print_info(&format!(
        "Benchmarking {} frameworks x {} scenarios x {} batches with {}",
        config.frameworks.len(),
        config.scenarios.len(),
        config.benchmark.batches,
        config.benchmark.tool
    ));

    let run_date = Local::now();
    let log_dir = config.dated_results_dir(run_date).join("logs");
    let supervisor = Supervisor::from_config(&config, Some(log_dir))?;
    let tool = Arc::new(ExternalLoadTool::from_config(&config.benchmark));
    let limits = Arc::new(FileDescriptorLimit::new(config.system.max_file_descriptors));

    let mut orchestrator = Orchestrator::new(config.clone(), Arc::new(supervisor), tool, limits)
        .with_run_date(run_date);
    if !args.no_report {
        orchestrator = orchestrator.with_report(Box::new(MarkdownReport::new(
            config.output.readme_template.clone(),
        )));
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping the run");
                cancel.cancel();
            }
        }
    });

    match orchestrator.run(&cancel).await {
        Ok(summary) => {
            print_item(&summary, ctx.format);
            match summary.status {
                RunStatus::Completed => print_success("Benchmark run completed"),
                RunStatus::Running => {
                    print_warning("Run is not complete, run again to resume where it stopped")
                }
            }
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Benchmark run failed: {}", e));
            print_info("Completed tests are saved, run again to resume");
            std::process::exit(1);
        }
    }
}
