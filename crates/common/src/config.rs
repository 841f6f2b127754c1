//! Benchmark configuration
//!
//! The YAML file names the frameworks under test, the request scenarios to
//! run against each of them, and the knobs for the load tool, the output
//! layout and process supervision. Missing sections and fields fall back to
//! the defaults below; [`BenchConfig::validate`] rejects anything that would
//! only fail once processes are already running.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{parse_duration_str, ToolKind};

/// Subdirectories created under every dated results directory
pub const RESULT_SUBDIRS: [&str; 4] = ["raw", "parts", "logs", "charts"];

/// Complete benchmark configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Frameworks under test, keyed by config key
    #[serde(default)]
    pub frameworks: BTreeMap<String, FrameworkConfig>,

    /// Request scenarios, keyed by config key
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,

    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

/// A framework server under test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// Display name, used in results and completion keys
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub port: u16,
    /// Base URL, e.g. `http://127.0.0.1:3000`
    #[serde(default)]
    pub url: String,
    /// Source directory the binary is built from
    #[serde(default)]
    pub build_path: String,
    #[serde(default)]
    pub binary_name: String,
    #[serde(default)]
    pub description: String,
    /// Extra command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A request scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Display name, used in results and completion keys
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_file: Option<PathBuf>,
}

impl ScenarioConfig {
    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }
}

/// Load tool and matrix configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub tool: ToolKind,
    /// Override for the tool executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_path: Option<PathBuf>,
    pub threads: u32,
    pub keep_alive: bool,
    /// 0 means duration based testing
    pub default_requests: u64,
    pub default_connections: u32,
    pub default_duration: String,
    pub batches: u32,
    pub max_retries: u32,
    /// Base retry sleep in seconds
    pub retry_sleep: u64,
    /// Pause between batches in seconds
    pub batch_pause: u64,
    /// Startup health wait in seconds
    pub health_check_timeout: u64,
    /// Health poll interval in seconds
    pub health_check_interval: f64,
    pub max_framework_restarts: u32,
    /// Lua script passed to wrk for POST scenarios
    pub post_script: PathBuf,
    /// Case-insensitive substrings marking an attempt error as transient
    pub retryable_patterns: Vec<String>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            tool: ToolKind::Wrk,
            tool_path: None,
            threads: 11,
            keep_alive: true,
            default_requests: 0,
            default_connections: 256,
            default_duration: "30s".to_string(),
            batches: 3,
            max_retries: 3,
            retry_sleep: 2,
            batch_pause: 5,
            health_check_timeout: 30,
            health_check_interval: 0.1,
            max_framework_restarts: 3,
            post_script: PathBuf::from("wrk/post.lua"),
            retryable_patterns: default_retryable_patterns(),
        }
    }
}

impl BenchmarkConfig {
    /// Startup health poll interval
    pub fn health_poll_interval(&self) -> Result<Duration> {
        let secs = self.health_check_interval;
        if !(secs.is_finite() && secs > 0.0) {
            return Err(Error::InvalidConfig(
                "health_check_interval must be positive".into(),
            ));
        }
        Duration::try_from_secs_f64(secs).map_err(|_| {
            Error::InvalidConfig(format!("health_check_interval {} is out of range", secs))
        })
    }
}

/// Error text fragments that mark a load test failure as transient
pub fn default_retryable_patterns() -> Vec<String> {
    [
        "signal: killed",
        "killed",
        "out of memory",
        "resource temporarily unavailable",
        "too many open files",
        "connection refused",
        "connection reset",
        "timeout",
        "context deadline exceeded",
        "deadline exceeded",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Output layout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
    /// chrono format string for the dated subdirectory
    pub date_format: String,
    /// Optional README template with `{{...}}` placeholders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme_template: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            date_format: "%Y-%m-%d".to_string(),
            readme_template: None,
        }
    }
}

/// Host tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub max_file_descriptors: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_file_descriptors: 65536,
        }
    }
}

/// Process supervision configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub max_restarts: u32,
    pub restart_delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_restart_delay_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub startup_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    /// Directory holding the built framework binaries
    pub build_dir: PathBuf,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_delay_seconds: 5,
            backoff_multiplier: 1.5,
            max_restart_delay_seconds: 60,
            health_check_interval_seconds: 5,
            startup_timeout_seconds: 30,
            shutdown_timeout_seconds: 10,
            build_dir: PathBuf::from("build"),
        }
    }
}

/// Command line overrides applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub requests: Option<u64>,
    pub connections: Option<u32>,
    pub duration: Option<String>,
    pub tool: Option<ToolKind>,
    pub batches: Option<u32>,
    pub retries: Option<u32>,
    pub results_dir: Option<PathBuf>,
    /// Restrict the run to these framework keys
    pub frameworks: Vec<String>,
    /// Restrict the run to these scenario keys
    pub scenarios: Vec<String>,
}

impl ConfigOverrides {
    /// Apply overrides, then re-validate
    pub fn apply(&self, config: &mut BenchConfig) -> Result<()> {
        if let Some(requests) = self.requests {
            config.benchmark.default_requests = requests;
        }
        if let Some(connections) = self.connections {
            config.benchmark.default_connections = connections;
        }
        if let Some(duration) = &self.duration {
            config.benchmark.default_duration = duration.clone();
        }
        if let Some(tool) = self.tool {
            config.benchmark.tool = tool;
        }
        if let Some(batches) = self.batches {
            config.benchmark.batches = batches;
        }
        if let Some(retries) = self.retries {
            config.benchmark.max_retries = retries;
        }
        if let Some(dir) = &self.results_dir {
            config.output.results_dir = dir.clone();
        }

        if !self.frameworks.is_empty() {
            config.frameworks = select(&config.frameworks, &self.frameworks, "framework")?;
        }
        if !self.scenarios.is_empty() {
            config.scenarios = select(&config.scenarios, &self.scenarios, "scenario")?;
        }

        config.validate()
    }
}

fn select<T: Clone>(
    all: &BTreeMap<String, T>,
    wanted: &[String],
    kind: &str,
) -> Result<BTreeMap<String, T>> {
    let mut selected = BTreeMap::new();
    for key in wanted {
        let key = key.trim();
        let item = all
            .get(key)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown {} '{}'", kind, key)))?;
        selected.insert(key.to_string(), item.clone());
    }
    Ok(selected)
}

impl BenchConfig {
    /// Load and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        info!(
            "Loaded configuration from {} ({} frameworks, {} scenarios)",
            path.display(),
            config.frameworks.len(),
            config.scenarios.len()
        );
        Ok(config)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: BenchConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a run
    pub fn validate(&self) -> Result<()> {
        if self.frameworks.is_empty() {
            return Err(Error::InvalidConfig("no frameworks configured".into()));
        }
        for (key, fw) in &self.frameworks {
            let missing = |field: &str| {
                Error::InvalidConfig(format!("framework '{}' is missing {}", key, field))
            };
            if fw.name.trim().is_empty() {
                return Err(missing("name"));
            }
            if fw.port == 0 {
                return Err(missing("port"));
            }
            if fw.url.trim().is_empty() {
                return Err(missing("url"));
            }
            if fw.build_path.trim().is_empty() {
                return Err(missing("build_path"));
            }
            if fw.binary_name.trim().is_empty() {
                return Err(missing("binary_name"));
            }
        }

        if self.scenarios.is_empty() {
            return Err(Error::InvalidConfig("no scenarios configured".into()));
        }
        for (key, sc) in &self.scenarios {
            let missing = |field: &str| {
                Error::InvalidConfig(format!("scenario '{}' is missing {}", key, field))
            };
            if sc.name.trim().is_empty() {
                return Err(missing("name"));
            }
            if sc.method.trim().is_empty() {
                return Err(missing("method"));
            }
            if sc.path.trim().is_empty() {
                return Err(missing("path"));
            }
            if sc.expected_status == 0 {
                return Err(missing("expected_status"));
            }
        }

        let bench = &self.benchmark;
        if bench.default_connections == 0 {
            return Err(Error::InvalidConfig("default_connections must be positive".into()));
        }
        if bench.batches == 0 {
            return Err(Error::InvalidConfig("batches must be positive".into()));
        }
        if bench.threads == 0 {
            return Err(Error::InvalidConfig("threads must be positive".into()));
        }
        if bench.tool == ToolKind::Ab && bench.default_requests == 0 {
            return Err(Error::InvalidConfig(
                "ab needs default_requests to be positive".into(),
            ));
        }
        bench.health_poll_interval()?;
        parse_duration_str(&bench.default_duration).map_err(|_| {
            Error::InvalidConfig(format!(
                "default_duration '{}' is not a duration",
                bench.default_duration
            ))
        })?;

        if self.output.results_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("results_dir must be set".into()));
        }
        if self.system.max_file_descriptors == 0 {
            return Err(Error::InvalidConfig(
                "max_file_descriptors must be positive".into(),
            ));
        }
        if !(self.process.backoff_multiplier.is_finite() && self.process.backoff_multiplier >= 0.0)
        {
            return Err(Error::InvalidConfig(
                "backoff_multiplier must be non-negative".into(),
            ));
        }

        debug!("Configuration validated");
        Ok(())
    }

    /// Number of cells in the full matrix
    pub fn total_cells(&self) -> usize {
        self.frameworks.len() * self.scenarios.len() * self.benchmark.batches as usize
    }

    /// Configured per-test duration
    pub fn test_duration(&self) -> Result<Duration> {
        parse_duration_str(&self.benchmark.default_duration)
    }

    /// `<results_dir>/<date>` for the given instant
    pub fn dated_results_dir(&self, now: DateTime<Local>) -> PathBuf {
        let date = now.format(&self.output.date_format).to_string();
        self.output.results_dir.join(date)
    }

    /// Create the dated results directory and its subdirectories
    pub fn prepare_results_dir(&self, now: DateTime<Local>) -> Result<PathBuf> {
        let dir = self.dated_results_dir(now);
        std::fs::create_dir_all(&dir)?;
        for sub in RESULT_SUBDIRS {
            std::fs::create_dir_all(dir.join(sub))?;
        }
        info!("Results directory: {}", dir.display());
        Ok(dir)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    pub(crate) const SAMPLE: &str = r#"
frameworks:
  gin:
    name: Gin
    version: "1.9"
    port: 3001
    url: http://127.0.0.1:3001
    build_path: frameworks/gin
    binary_name: gin-server
  echo:
    name: Echo
    port: 3002
    url: http://127.0.0.1:3002
    build_path: frameworks/echo
    binary_name: echo-server
scenarios:
  simple:
    name: Simple GET
    method: GET
    path: /
    expected_status: 200
  json:
    name: JSON POST
    method: POST
    path: /json
    expected_status: 200
    body_file: payloads/body.json
benchmark:
  batches: 2
  default_duration: 10s
"#;

    pub(crate) fn sample() -> BenchConfig {
        BenchConfig::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = sample();
        assert_eq!(config.frameworks.len(), 2);
        assert_eq!(config.benchmark.tool, ToolKind::Wrk);
        assert_eq!(config.benchmark.threads, 11);
        assert_eq!(config.benchmark.default_connections, 256);
        assert_eq!(config.benchmark.batches, 2);
        assert_eq!(config.benchmark.max_framework_restarts, 3);
        assert_eq!(config.process.max_restarts, 10);
        assert_eq!(config.system.max_file_descriptors, 65536);
        assert_eq!(config.test_duration().unwrap(), Duration::from_secs(10));
        assert_eq!(config.total_cells(), 8);
        assert!(config.scenarios["json"].is_post());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = sample();
        config.frameworks.get_mut("gin").unwrap().binary_name.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("gin"));
        assert!(err.contains("binary_name"));

        let mut config = sample();
        config.scenarios.get_mut("simple").unwrap().expected_status = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.benchmark.batches = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.benchmark.default_duration = "soon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let mut config = sample();
        config.benchmark.default_duration = "99999999999999999999999h".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("default_duration"));

        let mut config = sample();
        config.benchmark.health_check_interval = 1e30;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("out of range"));

        let mut config = sample();
        config.benchmark.health_check_interval = 0.0;
        assert!(config.validate().is_err());

        assert_eq!(
            sample().benchmark.health_poll_interval().unwrap(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_invalid_tool_is_rejected() {
        let yaml = format!("{}\n  tool: siege\n", SAMPLE.trim_end());
        assert!(BenchConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = sample();
        let overrides = ConfigOverrides {
            connections: Some(64),
            batches: Some(1),
            retries: Some(5),
            frameworks: vec!["echo".into()],
            ..Default::default()
        };
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.benchmark.default_connections, 64);
        assert_eq!(config.benchmark.max_retries, 5);
        assert_eq!(config.frameworks.len(), 1);
        assert!(config.frameworks.contains_key("echo"));
        assert_eq!(config.total_cells(), 2);
    }

    #[test]
    fn test_unknown_filter_is_an_error() {
        let mut config = sample();
        let overrides = ConfigOverrides {
            scenarios: vec!["missing".into()],
            ..Default::default()
        };
        let err = overrides.apply(&mut config).unwrap_err();
        assert!(err.to_string().contains("unknown scenario 'missing'"));
    }

    #[test]
    fn test_prepare_results_dir() {
        let tmp = TempDir::new().unwrap();
        let mut config = sample();
        config.output.results_dir = tmp.path().to_path_buf();

        let now = Local.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let dir = config.prepare_results_dir(now).unwrap();

        assert_eq!(dir, tmp.path().join("2024-03-09"));
        for sub in RESULT_SUBDIRS {
            assert!(dir.join(sub).is_dir());
        }
    }
}
