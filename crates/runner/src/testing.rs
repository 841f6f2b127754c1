//! In-process fakes for executor and orchestrator tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webbench_common::{BenchConfig, FrameworkConfig, ScenarioConfig, ToolKind};
use webbench_supervisor::SupervisorError;

use crate::control::TargetControl;
use crate::error::{AttemptError, AttemptKind};
use crate::executor::ExecutorSettings;
use crate::limits::LimitAdjuster;
use crate::tool::{LoadTool, ToolRun};

pub(crate) const WRK_OK: &str = "\
  Thread Stats   Avg      Stdev     Max   +/- Stdev
    Latency     1.00ms  100.00us   5.00ms   90.00%
  10000 requests in 1.00s, 1.20MB read
Requests/sec:  10000.00
Transfer/sec:      1.20MB
";

pub(crate) fn framework(name: &str, port: u16) -> FrameworkConfig {
    let slug = name.to_lowercase();
    FrameworkConfig {
        name: name.to_string(),
        port,
        url: format!("http://127.0.0.1:{}", port),
        build_path: format!("frameworks/{}", slug),
        binary_name: format!("{}-server", slug),
        ..Default::default()
    }
}

pub(crate) fn scenario(name: &str, method: &str, path: &str) -> ScenarioConfig {
    ScenarioConfig {
        name: name.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        expected_status: 200,
        ..Default::default()
    }
}

/// Frameworks `a` (A) and `b` (B), one `ping` scenario, two batches
pub(crate) fn two_target_config(results_dir: &Path) -> BenchConfig {
    let mut config = BenchConfig::default();
    config.frameworks.insert("a".into(), framework("A", 3001));
    config.frameworks.insert("b".into(), framework("B", 3002));
    config
        .scenarios
        .insert("ping".into(), scenario("Ping", "GET", "/ping"));
    config.benchmark.batches = 2;
    config.benchmark.default_duration = "1s".into();
    config.output.results_dir = results_dir.to_path_buf();
    config
}

pub(crate) fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        max_retries: 3,
        max_framework_restarts: 3,
        retry_sleep: Duration::from_millis(1),
        retry_jitter: Duration::ZERO,
        batch_pause: Duration::ZERO,
        unavailable_wait: Duration::ZERO,
        test_buffer: Duration::from_secs(1),
    }
}

#[derive(Default)]
struct FleetState {
    unhealthy: HashSet<String>,
    broken: HashSet<String>,
    restarts: HashMap<String, u32>,
    ensure_calls: usize,
    fail_start: bool,
    started: bool,
    shut_down: bool,
}

/// Fleet whose targets are healthy until crashed. A crashed target comes
/// back on the next `ensure_running` unless it was broken.
#[derive(Default)]
pub(crate) struct FakeFleet {
    state: Mutex<FleetState>,
}

impl FakeFleet {
    pub(crate) fn crash(&self, name: &str) {
        self.state.lock().unhealthy.insert(name.to_string());
    }

    pub(crate) fn break_target(&self, name: &str) {
        let mut state = self.state.lock();
        state.unhealthy.insert(name.to_string());
        state.broken.insert(name.to_string());
    }

    pub(crate) fn fail_start(&self) {
        self.state.lock().fail_start = true;
    }

    pub(crate) fn restarts(&self, name: &str) -> u32 {
        self.state.lock().restarts.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn ensure_calls(&self) -> usize {
        self.state.lock().ensure_calls
    }

    pub(crate) fn started(&self) -> bool {
        self.state.lock().started
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

#[async_trait]
impl TargetControl for FakeFleet {
    async fn start_all(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(SupervisorError::Spawn {
                name: "a".into(),
                reason: "exec format error".into(),
            });
        }
        state.started = true;
        Ok(())
    }

    async fn wait_until_healthy(
        &self,
        _cancel: &CancellationToken,
        _limit: Duration,
    ) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn ensure_running(&self, name: &str) -> Result<(), SupervisorError> {
        let mut state = self.state.lock();
        state.ensure_calls += 1;
        if !state.unhealthy.contains(name) {
            return Ok(());
        }
        if state.broken.contains(name) {
            return Err(SupervisorError::HealthCheck {
                name: name.to_string(),
                attempts: 1,
            });
        }
        state.unhealthy.remove(name);
        *state.restarts.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn is_healthy(&self, name: &str) -> bool {
        !self.state.lock().unhealthy.contains(name)
    }

    async fn shutdown(&self) {
        self.state.lock().shut_down = true;
    }
}

/// Scripted outcome of one tool invocation
pub(crate) enum Step {
    /// Tool exits 1 printing the given output
    Fail(&'static str),
    /// Like `Fail`, and the named target goes down
    Crash(&'static str, &'static str),
    /// Tool runs past its deadline after printing the given output
    Stall(&'static str),
    Error(AttemptError),
}

/// Load tool replaying per-framework scripts, succeeding once a script runs out
pub(crate) struct ScriptedTool {
    fleet: Option<Arc<FakeFleet>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTool {
    pub(crate) fn new(fleet: Option<Arc<FakeFleet>>) -> Self {
        Self {
            fleet,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn script(&self, framework: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .insert(framework.to_string(), steps.into_iter().collect());
    }

    /// `framework/scenario` of every invocation, in order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LoadTool for ScriptedTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Wrk
    }

    async fn run(
        &self,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        _limit: Duration,
        _cancel: &CancellationToken,
    ) -> Result<ToolRun, AttemptError> {
        self.calls
            .lock()
            .push(format!("{}/{}", framework.name, scenario.name));
        let step = self
            .scripts
            .lock()
            .get_mut(&framework.name)
            .and_then(|steps| steps.pop_front());

        let failed = |output: &str| ToolRun {
            output: output.to_string(),
            elapsed: Duration::from_millis(1),
            failure: Some(AttemptError::new(AttemptKind::Exit, "exit status 1")),
        };
        match step {
            None => Ok(ToolRun {
                output: WRK_OK.to_string(),
                elapsed: Duration::from_millis(1),
                failure: None,
            }),
            Some(Step::Fail(output)) => Ok(failed(output)),
            Some(Step::Crash(target, output)) => {
                if let Some(fleet) = &self.fleet {
                    fleet.crash(target);
                }
                Ok(failed(output))
            }
            Some(Step::Stall(output)) => Ok(ToolRun {
                output: output.to_string(),
                elapsed: Duration::from_millis(1),
                failure: Some(AttemptError::new(
                    AttemptKind::Timeout,
                    "context deadline exceeded after 1s",
                )),
            }),
            Some(Step::Error(e)) => Err(e),
        }
    }
}

/// Counts limit applications
#[derive(Default)]
pub(crate) struct CountingLimiter {
    calls: AtomicUsize,
}

impl CountingLimiter {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LimitAdjuster for CountingLimiter {
    fn try_apply(&self) -> Result<u64, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(65536)
    }
}
