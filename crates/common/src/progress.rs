//! Durable run progress
//!
//! One JSON document per results directory records which matrix cells have
//! completed, which failed, and every result collected so far. Every mutation
//! is a full read-modify-write of that document, flushed before returning, so
//! an interrupted run can be resumed at the first incomplete cell.
//!
//! The store assumes a single writer. Concurrent writers are not coordinated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::types::{cell_key, RunStatus, TestResult};

/// File name of the snapshot inside a results directory
pub const STATE_FILE_NAME: &str = "progress_state.json";

/// Persisted progress of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub current_framework: String,
    #[serde(default)]
    pub current_scenario: String,
    #[serde(default)]
    pub current_batch: u32,
    #[serde(default)]
    pub total_batches: u32,
    #[serde(default)]
    pub current_retry: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub completed_tests: usize,
    #[serde(default)]
    pub total_tests: usize,
    /// Completion keys, never duplicated
    #[serde(default)]
    pub completed_tests_list: Vec<String>,
    #[serde(default)]
    pub failed_tests: Vec<String>,
    #[serde(default)]
    pub results: Vec<TestResult>,
    #[serde(default)]
    pub config: BenchConfig,
    #[serde(default)]
    pub status: RunStatus,
}

impl ProgressSnapshot {
    /// Fresh `running` snapshot for a configuration
    pub fn new(config: &BenchConfig) -> Self {
        let now = Utc::now();
        let mut snapshot = Self {
            run_id: new_run_id(),
            start_time: now,
            last_update: now,
            current_framework: String::new(),
            current_scenario: String::new(),
            current_batch: 0,
            total_batches: 0,
            current_retry: 0,
            max_retries: 0,
            completed_tests: 0,
            total_tests: 0,
            completed_tests_list: Vec::new(),
            failed_tests: Vec::new(),
            results: Vec::new(),
            config: BenchConfig::default(),
            status: RunStatus::Running,
        };
        snapshot.apply_config(config);
        snapshot
    }

    fn apply_config(&mut self, config: &BenchConfig) {
        self.config = config.clone();
        self.total_tests = config.total_cells();
        self.total_batches = config.benchmark.batches;
        self.max_retries = config.benchmark.max_retries;
    }

    /// Whether a cell key is already recorded as completed
    pub fn is_completed(&self, key: &str) -> bool {
        self.completed_tests_list.iter().any(|k| k == key)
    }
}

/// Summary of a snapshot used to report where a run stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub run_id: String,
    pub status: RunStatus,
    pub last_framework: String,
    pub last_scenario: String,
    pub last_batch: u32,
    pub last_retry: u32,
    pub completed_tests: Vec<String>,
    pub failed_tests: Vec<String>,
    pub total_tests: usize,
    pub results_dir: PathBuf,
}

impl ResumeInfo {
    /// True when a prior run stopped before finishing
    pub fn is_incomplete(&self) -> bool {
        self.status != RunStatus::Completed
    }
}

/// `run_YYYYmmdd_HHMMSS` identifier for a new run
pub fn new_run_id() -> String {
    format!("run_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

/// File backed progress store for one results directory
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    path: PathBuf,
}

impl ProgressStore {
    /// Attach to a results directory
    pub fn new(results_dir: impl AsRef<Path>) -> Self {
        let dir = results_dir.as_ref().to_path_buf();
        let path = dir.join(STATE_FILE_NAME);
        Self { dir, path }
    }

    /// Path of the backing state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Results directory the store is attached to
    pub fn results_dir(&self) -> &Path {
        &self.dir
    }

    /// Read the snapshot, `None` when no state file exists
    pub fn load(&self) -> Result<Option<ProgressSnapshot>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage(&self.path, e)),
        };

        let snapshot = serde_json::from_slice(&data)
            .map_err(|e| Error::storage(&self.path, format!("corrupt state file: {}", e)))?;
        Ok(Some(snapshot))
    }

    /// Atomically replace the snapshot, stamping its update time.
    ///
    /// The results directory must already exist.
    pub fn save(&self, snapshot: &mut ProgressSnapshot) -> Result<()> {
        snapshot.last_update = Utc::now();
        let data = serde_json::to_vec_pretty(snapshot)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::storage(&self.path, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::storage(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::storage(&self.path, e.error))?;

        debug!("Saved progress state to {}", self.path.display());
        Ok(())
    }

    /// Remove the state file, if any
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(&self.path, e)),
        }
    }

    /// Resume, seed or create the snapshot for a run of `config`.
    ///
    /// A `running` snapshot is resumed in place. A `completed` snapshot with
    /// completed cells seeds a new run that inherits those cells and their
    /// results. Anything else starts from scratch. A snapshot that cannot be
    /// written is still returned so the run can continue without resume.
    pub fn initialize(&self, config: &BenchConfig) -> ProgressSnapshot {
        let existing = match self.load() {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Ignoring unreadable progress state: {}", e);
                None
            }
        };

        let mut snapshot = match existing {
            Some(mut prior) if prior.status != RunStatus::Completed => {
                info!(
                    "Resuming run {} with {} completed tests",
                    prior.run_id,
                    prior.completed_tests_list.len()
                );
                prior.apply_config(config);
                prior.completed_tests = prior.completed_tests_list.len();
                prior.status = RunStatus::Running;
                prior
            }
            Some(prior) if !prior.completed_tests_list.is_empty() => {
                info!(
                    "Seeding new run from completed run {} with {} existing tests",
                    prior.run_id,
                    prior.completed_tests_list.len()
                );
                let mut fresh = ProgressSnapshot::new(config);
                fresh.completed_tests = prior.completed_tests_list.len();
                fresh.completed_tests_list = prior.completed_tests_list;
                fresh.results = prior.results;
                fresh
            }
            _ => {
                let fresh = ProgressSnapshot::new(config);
                info!("Starting new run {}", fresh.run_id);
                fresh
            }
        };

        if let Err(e) = self.save(&mut snapshot) {
            warn!("Failed to save initial progress state: {}", e);
        }
        snapshot
    }

    /// Record a successful cell. Idempotent per completion key.
    pub fn record_success(&self, result: &TestResult) -> Result<()> {
        let Some(mut snapshot) = self.load()? else {
            debug!("No progress state, not recording {}", result.cell_key());
            return Ok(());
        };

        snapshot.results.push(result.clone());
        snapshot.current_framework = result.framework.clone();
        snapshot.current_scenario = result.scenario.clone();
        snapshot.current_batch = result.batch;
        snapshot.current_retry = result.retry;

        let key = result.cell_key();
        if !snapshot.is_completed(&key) {
            snapshot.completed_tests_list.push(key);
        }
        snapshot.completed_tests = snapshot.completed_tests_list.len();

        self.save(&mut snapshot)
    }

    /// Record a permanently failed cell
    pub fn record_failure(
        &self,
        framework: &str,
        scenario: &str,
        batch: u32,
        error: &str,
    ) -> Result<()> {
        let Some(mut snapshot) = self.load()? else {
            return Ok(());
        };

        snapshot.failed_tests.push(format!(
            "{}: {}",
            cell_key(framework, scenario, batch),
            error
        ));
        snapshot.current_framework = framework.to_string();
        snapshot.current_scenario = scenario.to_string();
        snapshot.current_batch = batch;

        self.save(&mut snapshot)
    }

    /// Mark the run completed if every cell has completed.
    ///
    /// Returns the resulting status. An unfinished matrix stays `running` so
    /// the next invocation resumes it.
    pub fn finish(&self) -> Result<Option<RunStatus>> {
        let Some(mut snapshot) = self.load()? else {
            return Ok(None);
        };

        if snapshot.completed_tests >= snapshot.total_tests {
            snapshot.status = RunStatus::Completed;
            self.save(&mut snapshot)?;
            info!(
                "Run {} completed ({}/{})",
                snapshot.run_id, snapshot.completed_tests, snapshot.total_tests
            );
        } else {
            info!(
                "Run {} stopped with {}/{} tests completed, state kept as running for resume",
                snapshot.run_id, snapshot.completed_tests, snapshot.total_tests
            );
        }
        Ok(Some(snapshot.status))
    }

    /// Where the persisted run stopped, if there is one
    pub fn resume_info(&self) -> Result<Option<ResumeInfo>> {
        Ok(self.load()?.map(|s| ResumeInfo {
            run_id: s.run_id,
            status: s.status,
            last_framework: s.current_framework,
            last_scenario: s.current_scenario,
            last_batch: s.current_batch,
            last_retry: s.current_retry,
            completed_tests: s.completed_tests_list,
            failed_tests: s.failed_tests,
            total_tests: s.total_tests,
            results_dir: self.dir.clone(),
        }))
    }
}
