//! End-to-end benchmark run

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use webbench_common::{BenchConfig, ProgressStore, RunStatus, TestResult};

use crate::control::TargetControl;
use crate::error::{Result, RunError};
use crate::executor::{Executor, ExecutorSettings};
use crate::limits::LimitAdjuster;
use crate::report::{clear_stale_artifacts, save_results, ReportGenerator};
use crate::tool::LoadTool;

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub results_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Cells run by this invocation
    pub executed: usize,
    /// Cells skipped because an earlier run completed them
    pub skipped: usize,
    /// Results in the saved summary, including inherited ones
    pub total_results: usize,
    pub status: RunStatus,
}

/// Drives a whole run: fleet startup, the matrix, artifacts and shutdown
pub struct Orchestrator {
    config: BenchConfig,
    settings: ExecutorSettings,
    control: Arc<dyn TargetControl>,
    tool: Arc<dyn LoadTool>,
    limits: Arc<dyn LimitAdjuster>,
    reports: Vec<Box<dyn ReportGenerator>>,
    /// Picks the dated results directory
    run_date: DateTime<Local>,
}

impl Orchestrator {
    pub fn new(
        config: BenchConfig,
        control: Arc<dyn TargetControl>,
        tool: Arc<dyn LoadTool>,
        limits: Arc<dyn LimitAdjuster>,
    ) -> Self {
        let settings = ExecutorSettings::from_config(&config);
        Self {
            config,
            settings,
            control,
            tool,
            limits,
            reports: Vec::new(),
            run_date: Local::now(),
        }
    }

    /// Pin the instant that names the dated results directory
    pub fn with_run_date(mut self, run_date: DateTime<Local>) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add a best-effort report generated after the results are saved
    pub fn with_report(mut self, report: Box<dyn ReportGenerator>) -> Self {
        self.reports.push(report);
        self
    }

    /// Run the configured matrix in the results directory for the run date
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let started_at = Utc::now();

        match self.limits.try_apply() {
            Ok(limit) => info!("File descriptor limit: {}", limit),
            Err(e) => warn!("Failed to adjust resource limits: {}", e),
        }

        let results_dir = self.config.prepare_results_dir(self.run_date)?;
        let store = ProgressStore::new(&results_dir);

        let resume = match store.resume_info() {
            Ok(info) => info,
            Err(e) => {
                warn!("Could not read resume info: {}", e);
                None
            }
        };
        match &resume {
            Some(info) if info.is_incomplete() => info!(
                "Found incomplete run {} ({}/{} tests completed, last: {} - {} batch {})",
                info.run_id,
                info.completed_tests.len(),
                info.total_tests,
                info.last_framework,
                info.last_scenario,
                info.last_batch
            ),
            _ => {
                if let Err(e) = clear_stale_artifacts(&results_dir) {
                    warn!("Failed to clear previous results: {}", e);
                }
            }
        }

        let snapshot = store.initialize(&self.config);
        let run_id = snapshot.run_id.clone();
        let completed: HashSet<String> = snapshot.completed_tests_list.iter().cloned().collect();

        let executor = Executor::new(
            self.config.clone(),
            self.settings.clone(),
            self.control.clone(),
            self.tool.clone(),
            self.limits.clone(),
            store.clone(),
        )?;

        info!("Starting {} frameworks", self.config.frameworks.len());
        if let Err(e) = self.control.start_all().await {
            return self.abort(RunError::Startup(e)).await;
        }

        let health_timeout = Duration::from_secs(self.config.benchmark.health_check_timeout);
        if let Err(e) = self.control.wait_until_healthy(cancel, health_timeout).await {
            return self.abort(RunError::Health(e)).await;
        }
        info!("All frameworks healthy");

        let outcome = match executor.run_benchmarks(cancel, &completed).await {
            Ok(outcome) => outcome,
            Err(e) => return self.abort(e).await,
        };

        let results = self.final_results(&store, executor.results());
        if let Err(e) = save_results(&results_dir, &self.config, &results) {
            return self.abort(e).await;
        }

        for report in &self.reports {
            match report.try_generate(&results_dir, &results) {
                Ok(path) => info!("Generated {} at {}", report.name(), path.display()),
                Err(e) => warn!("Failed to generate {}: {}", report.name(), e),
            }
        }

        self.control.shutdown().await;

        let status = match store.finish() {
            Ok(Some(status)) => status,
            Ok(None) => RunStatus::Running,
            Err(e) => {
                warn!("Failed to finalize progress state: {}", e);
                RunStatus::Running
            }
        };

        Ok(RunSummary {
            run_id,
            results_dir,
            started_at,
            finished_at: Utc::now(),
            executed: outcome.executed,
            skipped: outcome.skipped,
            total_results: results.len(),
            status,
        })
    }

    /// Snapshot results when available, they include cells from earlier runs
    fn final_results(&self, store: &ProgressStore, in_memory: Vec<TestResult>) -> Vec<TestResult> {
        match store.load() {
            Ok(Some(snapshot)) if !snapshot.results.is_empty() => snapshot.results,
            Ok(_) => in_memory,
            Err(e) => {
                warn!("Using in-memory results, progress state unreadable: {}", e);
                in_memory
            }
        }
    }

    async fn abort(&self, err: RunError) -> Result<RunSummary> {
        error!("Run failed: {}", err);
        self.control.shutdown().await;
        Err(err)
    }
}
