//! Test matrix execution
//!
//! Walks every framework × scenario × batch cell, skipping cells a previous
//! run already completed. Each cell is retried with exponential backoff on
//! transient failures, and the framework is restarted through the
//! supervisor when it stops answering. The first cell that cannot be
//! completed aborts the whole matrix.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webbench_common::{
    cell_key, BenchConfig, FrameworkConfig, ProgressStore, ScenarioConfig, TestResult,
};

use crate::control::TargetControl;
use crate::error::{AttemptError, AttemptKind, Result, RunError};
use crate::limits::LimitAdjuster;
use crate::parse::{parse_output, ParsedMetrics};
use crate::retry::{backoff, jitter, RetryClassifier};
use crate::tool::LoadTool;

/// Timing and retry knobs for the executor
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    /// Framework restarts allowed per cell, separate from `max_retries`
    pub max_framework_restarts: u32,
    /// Base of the exponential retry backoff
    pub retry_sleep: Duration,
    /// Upper bound of the random jitter added to each backoff
    pub retry_jitter: Duration,
    /// Pause between batches of the same framework and scenario
    pub batch_pause: Duration,
    /// Wait after a failed `ensure_running` before trying again
    pub unavailable_wait: Duration,
    /// Slack added to the test duration for tool startup and teardown
    pub test_buffer: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &BenchConfig) -> Self {
        let bench = &config.benchmark;
        Self {
            max_retries: bench.max_retries,
            max_framework_restarts: bench.max_framework_restarts,
            retry_sleep: Duration::from_secs(bench.retry_sleep),
            retry_jitter: Duration::from_millis(1000),
            batch_pause: Duration::from_secs(bench.batch_pause),
            unavailable_wait: Duration::from_secs(5),
            test_buffer: Duration::from_secs(60),
        }
    }
}

/// Counts of what a matrix pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatrixOutcome {
    pub executed: usize,
    pub skipped: usize,
}

/// Replace characters that do not belong in a file name
fn sanitize(name: &str) -> String {
    name.replace(&[' ', '/'][..], "_")
}

/// File name under `raw/` holding the tool output of one attempt
pub fn raw_file_name(framework: &str, scenario: &str, batch: u32, retry: u32) -> String {
    format!(
        "{}_{}_batch{}_retry{}.txt",
        sanitize(framework),
        sanitize(scenario),
        batch,
        retry
    )
}

/// Reports matrix progress in steps of at least one percent
#[derive(Debug)]
pub(crate) struct ProgressMeter {
    total: usize,
    done: usize,
    last_percent: usize,
}

impl ProgressMeter {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            last_percent: 0,
        }
    }

    /// Count one cell, returning the percentage when it should be reported
    pub(crate) fn advance(&mut self) -> Option<usize> {
        self.done += 1;
        if self.total == 0 {
            return None;
        }
        let percent = self.done * 100 / self.total;
        if percent > self.last_percent {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }

    fn report(&mut self) {
        if let Some(percent) = self.advance() {
            info!("Progress: {}/{} tests ({}%)", self.done, self.total, percent);
        }
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        _ = sleep(duration) => Ok(()),
    }
}

/// Runs the test matrix against a supervised fleet
pub struct Executor {
    config: BenchConfig,
    settings: ExecutorSettings,
    test_duration: Duration,
    control: Arc<dyn TargetControl>,
    tool: Arc<dyn LoadTool>,
    limits: Arc<dyn LimitAdjuster>,
    classifier: RetryClassifier,
    store: ProgressStore,
    results: Mutex<Vec<TestResult>>,
}

impl Executor {
    pub fn new(
        config: BenchConfig,
        settings: ExecutorSettings,
        control: Arc<dyn TargetControl>,
        tool: Arc<dyn LoadTool>,
        limits: Arc<dyn LimitAdjuster>,
        store: ProgressStore,
    ) -> Result<Self> {
        let test_duration = config.test_duration()?;
        let classifier = RetryClassifier::new(&config.benchmark.retryable_patterns);
        Ok(Self {
            config,
            settings,
            test_duration,
            control,
            tool,
            limits,
            classifier,
            store,
            results: Mutex::new(Vec::new()),
        })
    }

    /// Results collected by this executor, in completion order
    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().clone()
    }

    /// Best-effort resource limit adjustment
    pub fn apply_limits(&self) {
        match self.limits.try_apply() {
            Ok(limit) => debug!("Resource limit in effect: {}", limit),
            Err(e) => warn!("Failed to adjust resource limits: {}", e),
        }
    }

    /// Run every cell not already in `completed`.
    ///
    /// `completed` holds completion keys built from display names. The first
    /// cell that fails permanently is recorded and aborts the pass.
    pub async fn run_benchmarks(
        &self,
        cancel: &CancellationToken,
        completed: &HashSet<String>,
    ) -> Result<MatrixOutcome> {
        let batches = self.config.benchmark.batches;
        let mut meter = ProgressMeter::new(self.config.total_cells());
        let mut outcome = MatrixOutcome::default();

        info!(
            "Running {} tests ({} already completed)",
            self.config.total_cells(),
            completed.len()
        );

        for (key, framework) in &self.config.frameworks {
            for scenario in self.config.scenarios.values() {
                for batch in 1..=batches {
                    if cancel.is_cancelled() {
                        return Err(RunError::Cancelled);
                    }

                    let cell = cell_key(&framework.name, &scenario.name, batch);
                    if completed.contains(&cell) {
                        info!("Skipping completed test {}", cell);
                        outcome.skipped += 1;
                        meter.report();
                        continue;
                    }

                    info!(
                        "Testing {} - {} (Batch {}/{})",
                        framework.name, scenario.name, batch, batches
                    );

                    match self
                        .run_test_with_restart(cancel, key, framework, scenario, batch)
                        .await
                    {
                        Ok(result) => {
                            if let Err(e) = self.store.record_success(&result) {
                                warn!("Failed to record progress for {}: {}", cell, e);
                            }
                            info!(
                                "{} - {} (Batch {}): {:.2} req/s",
                                framework.name, scenario.name, batch, result.requests_per_sec
                            );
                            self.results.lock().push(result);
                            outcome.executed += 1;
                        }
                        Err(RunError::Cancelled) => return Err(RunError::Cancelled),
                        Err(e) => {
                            error!("Test {} failed: {}", cell, e);
                            if let Err(se) = self.store.record_failure(
                                &framework.name,
                                &scenario.name,
                                batch,
                                &e.to_string(),
                            ) {
                                warn!("Failed to record failure for {}: {}", cell, se);
                            }
                            return Err(RunError::Cell {
                                framework: framework.name.clone(),
                                scenario: scenario.name.clone(),
                                batch,
                                source: Box::new(e),
                            });
                        }
                    }
                    meter.report();

                    if batch < batches {
                        pause(cancel, self.settings.batch_pause).await?;
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn ensure_running(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<std::result::Result<(), webbench_supervisor::SupervisorError>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RunError::Cancelled),
            res = self.control.ensure_running(key) => Ok(res),
        }
    }

    /// One cell with bounded retries and framework restarts
    pub(crate) async fn run_test_with_restart(
        &self,
        cancel: &CancellationToken,
        key: &str,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        batch: u32,
    ) -> Result<TestResult> {
        let max_retries = self.settings.max_retries;
        let max_restarts = self.settings.max_framework_restarts;
        let mut failed_attempts = 0u32;
        let mut restarts = 0u32;
        let mut last_error: Option<AttemptError> = None;

        for attempt in 0..=max_retries {
            if let Err(e) = self.ensure_running(cancel, key).await? {
                error!("Framework {} is not available: {}", framework.name, e);
                if restarts < max_restarts {
                    restarts += 1;
                    warn!(
                        "Waiting for {} to recover (restart {}/{})",
                        framework.name, restarts, max_restarts
                    );
                    pause(cancel, self.settings.unavailable_wait).await?;
                    continue;
                }
                return Err(RunError::TargetUnavailable {
                    framework: framework.name.clone(),
                    restarts: max_restarts,
                    source: e,
                });
            }

            let err = match self.run_test(cancel, framework, scenario, batch, attempt).await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            "{} - {} (Batch {}) succeeded on attempt {}",
                            framework.name,
                            scenario.name,
                            batch,
                            attempt + 1
                        );
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            failed_attempts += 1;
            warn!(
                "Attempt {}/{} for {} - {} (Batch {}) failed: {}",
                attempt + 1,
                max_retries + 1,
                framework.name,
                scenario.name,
                batch,
                err
            );

            if !self.classifier.is_retryable(&err) {
                error!("Non-retryable error, giving up on {} - {}", framework.name, scenario.name);
                last_error = Some(err);
                break;
            }
            last_error = Some(err);

            if attempt < max_retries {
                if !self.control.is_healthy(key).await {
                    if restarts < max_restarts {
                        restarts += 1;
                        warn!(
                            "Framework {} is unhealthy, restarting ({}/{})",
                            framework.name, restarts, max_restarts
                        );
                        if let Err(e) = self.ensure_running(cancel, key).await? {
                            error!("Failed to restart {}: {}", framework.name, e);
                            continue;
                        }
                        info!("Framework {} restarted", framework.name);
                    } else {
                        error!(
                            "Framework {} exceeded {} restart attempts",
                            framework.name, max_restarts
                        );
                        break;
                    }
                }

                let delay = backoff(self.settings.retry_sleep, attempt)
                    .saturating_add(jitter(self.settings.retry_jitter));
                info!("Retrying in {:?}", delay);
                pause(cancel, delay).await?;
                self.apply_limits();
            }
        }

        Err(RunError::RetriesExhausted {
            retries: failed_attempts.saturating_sub(1),
            restarts,
            reason: last_error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("framework {} unavailable", framework.name)),
        })
    }

    /// One attempt: run the tool, archive its output, parse it
    async fn run_test(
        &self,
        cancel: &CancellationToken,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        batch: u32,
        retry: u32,
    ) -> std::result::Result<TestResult, AttemptError> {
        let limit = self.test_duration.saturating_add(self.settings.test_buffer);
        let run = self.tool.run(framework, scenario, limit, cancel).await?;
        debug!("{} finished in {:?}", self.tool.kind(), run.elapsed);

        let raw_dir = self.store.results_dir().join("raw");
        let raw_path = raw_dir.join(raw_file_name(&framework.name, &scenario.name, batch, retry));
        if let Err(e) = save_raw(&raw_dir, &raw_path, &run.output).await {
            warn!("Failed to save raw output to {}: {}", raw_path.display(), e);
        }

        if let Some(failure) = run.failure {
            return Err(AttemptError::new(
                failure.kind,
                format!("command failed: {}, output: {}", failure.message, run.output),
            ));
        }

        let metrics = parse_output(self.tool.kind(), &run.output);
        Ok(self.build_result(metrics, framework, scenario, batch, retry))
    }

    fn build_result(
        &self,
        metrics: ParsedMetrics,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        batch: u32,
        retry: u32,
    ) -> TestResult {
        let requests = if metrics.requests > 0 {
            metrics.requests
        } else {
            self.config.benchmark.default_requests
        };
        TestResult {
            framework: framework.name.clone(),
            scenario: scenario.name.clone(),
            requests,
            connections: self.config.benchmark.default_connections,
            duration: self.test_duration,
            requests_per_sec: metrics.requests_per_sec,
            latency_mean: metrics.latency_mean,
            latency_p50: metrics.latency_p50,
            latency_p90: metrics.latency_p90,
            latency_p99: metrics.latency_p99,
            max_latency: metrics.max_latency,
            transfer_rate: metrics.transfer_rate,
            errors: metrics.errors,
            non_2xx: metrics.non_2xx,
            timestamp: Utc::now(),
            batch,
            retry,
        }
    }
}

async fn save_raw(dir: &Path, path: &Path, output: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, output).await
}
