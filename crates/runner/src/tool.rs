//! External load generation tools

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webbench_common::config::BenchmarkConfig;
use webbench_common::{FrameworkConfig, ScenarioConfig, ToolKind};
use webbench_supervisor::process::describe_exit;

use crate::error::{AttemptError, AttemptKind};

/// Output of one completed tool invocation
#[derive(Debug, Clone)]
pub struct ToolRun {
    /// Combined stdout and stderr
    pub output: String,
    pub elapsed: Duration,
    /// Set when the tool exited unsuccessfully or ran past its deadline.
    /// `output` then holds whatever was written before it stopped.
    pub failure: Option<AttemptError>,
}

/// Runs one load test against a framework
#[async_trait]
pub trait LoadTool: Send + Sync {
    /// Output dialect the tool prints
    fn kind(&self) -> ToolKind;

    /// Run the test, bounded by `limit` and aborted when `cancel` fires
    async fn run(
        &self,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, AttemptError>;
}

/// `wrk` or `ab` spawned as a child process
#[derive(Debug, Clone)]
pub struct ExternalLoadTool {
    kind: ToolKind,
    program: PathBuf,
    threads: u32,
    connections: u32,
    requests: u64,
    duration: String,
    keep_alive: bool,
    post_script: PathBuf,
}

/// Throughput assumed when turning a request count into a wrk duration
const ESTIMATED_RPS: f64 = 10_000.0;

/// How long to wait for the output pipes to drain once the tool is gone
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

impl ExternalLoadTool {
    pub fn from_config(bench: &BenchmarkConfig) -> Self {
        Self {
            kind: bench.tool,
            program: bench
                .tool_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(bench.tool.program())),
            threads: bench.threads,
            connections: bench.default_connections,
            requests: bench.default_requests,
            duration: bench.default_duration.clone(),
            keep_alive: bench.keep_alive,
            post_script: bench.post_script.clone(),
        }
    }

    /// Command line arguments for a cell
    pub fn args(&self, framework: &FrameworkConfig, scenario: &ScenarioConfig) -> Vec<String> {
        match self.kind {
            ToolKind::Wrk => self.wrk_args(framework, scenario),
            ToolKind::Ab => self.ab_args(framework, scenario),
        }
    }

    fn wrk_args(&self, framework: &FrameworkConfig, scenario: &ScenarioConfig) -> Vec<String> {
        let duration = if self.requests > 0 {
            let estimated = (self.requests as f64 / ESTIMATED_RPS).max(1.0);
            format!("{:.0}s", estimated)
        } else {
            self.duration.clone()
        };

        let mut args = vec![
            "-t".to_string(),
            self.threads.to_string(),
            "-c".to_string(),
            self.connections.to_string(),
            "-d".to_string(),
            duration,
            "--latency".to_string(),
        ];
        if self.keep_alive {
            args.push("-H".to_string());
            args.push("Connection: keep-alive".to_string());
        }
        if scenario.is_post() {
            args.push("-s".to_string());
            args.push(self.post_script.display().to_string());
        }
        args.push(target_url(framework, scenario));
        args
    }

    fn ab_args(&self, framework: &FrameworkConfig, scenario: &ScenarioConfig) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            self.requests.to_string(),
            "-c".to_string(),
            self.connections.to_string(),
        ];
        if self.keep_alive {
            args.push("-k".to_string());
        }
        if let (true, Some(body)) = (scenario.is_post(), &scenario.body_file) {
            args.push("-p".to_string());
            args.push(body.display().to_string());
        }
        args.push(target_url(framework, scenario));
        args
    }
}

fn target_url(framework: &FrameworkConfig, scenario: &ScenarioConfig) -> String {
    format!("{}{}", framework.url, scenario.path)
}

#[async_trait]
impl LoadTool for ExternalLoadTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    async fn run(
        &self,
        framework: &FrameworkConfig,
        scenario: &ScenarioConfig,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, AttemptError> {
        let args = self.args(framework, scenario);
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AttemptError::new(
                    AttemptKind::Spawn,
                    format!("failed to start {}: {}", self.program.display(), e),
                )
            })?;

        let stdout = Captured::default();
        let stderr = Captured::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(capture(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(capture(pipe, stderr.clone()));
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::new(AttemptKind::Cancelled, "test cancelled")),
            res = timeout(limit, child.wait()) => match res {
                Err(_) => Ok(Some(AttemptError::new(
                    AttemptKind::Timeout,
                    format!("context deadline exceeded after {:?}", limit),
                ))),
                Ok(Err(e)) => Err(AttemptError::new(AttemptKind::Io, format!("wait failed: {}", e))),
                Ok(Ok(status)) => Ok((!status.success())
                    .then(|| AttemptError::new(AttemptKind::Exit, describe_exit(status)))),
            },
        };

        let exited = match &outcome {
            Ok(None) => true,
            Ok(Some(failure)) => failure.kind == AttemptKind::Exit,
            Err(_) => false,
        };
        if !exited {
            kill_group(&mut child).await;
        }
        let failure = outcome?;

        for reader in readers {
            if timeout(OUTPUT_DRAIN, reader).await.is_err() {
                debug!("Output of {} still open after {:?}", self.program.display(), OUTPUT_DRAIN);
            }
        }
        let mut combined = String::from_utf8_lossy(&stdout.lock()).into_owned();
        combined.push_str(&String::from_utf8_lossy(&stderr.lock()));

        Ok(ToolRun {
            output: combined,
            elapsed: started.elapsed(),
            failure,
        })
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Copy a pipe into `buf` as it arrives, so a killed tool still leaves its output behind
fn capture<R>(mut pipe: R, buf: Captured) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// SIGKILL the tool and anything it spawned, then reap it
async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg {} failed: {}", pid, e);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to reap load tool: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{framework, scenario};

    fn tool(kind: ToolKind) -> ExternalLoadTool {
        let mut bench = BenchmarkConfig {
            tool: kind,
            threads: 4,
            default_connections: 64,
            default_duration: "10s".to_string(),
            ..Default::default()
        };
        if kind == ToolKind::Ab {
            bench.default_requests = 5000;
        }
        ExternalLoadTool::from_config(&bench)
    }

    #[test]
    fn test_wrk_args() {
        let fw = framework("Gin", 3001);
        let args = tool(ToolKind::Wrk).args(&fw, &scenario("Simple GET", "GET", "/"));
        assert_eq!(
            args,
            vec![
                "-t",
                "4",
                "-c",
                "64",
                "-d",
                "10s",
                "--latency",
                "-H",
                "Connection: keep-alive",
                "http://127.0.0.1:3001/"
            ]
        );

        let args = tool(ToolKind::Wrk).args(&fw, &scenario("JSON POST", "POST", "/json"));
        assert!(args.windows(2).any(|w| w == ["-s", "wrk/post.lua"]));
        assert_eq!(args.last().unwrap(), "http://127.0.0.1:3001/json");
    }

    #[test]
    fn test_wrk_duration_from_request_count() {
        let mut wrk = tool(ToolKind::Wrk);
        wrk.requests = 25_000;
        let fw = framework("Gin", 3001);
        let args = wrk.args(&fw, &scenario("Simple GET", "GET", "/"));
        assert!(args.windows(2).any(|w| w == ["-d", "2s"]));

        wrk.requests = 10;
        let args = wrk.args(&fw, &scenario("Simple GET", "GET", "/"));
        assert!(args.windows(2).any(|w| w == ["-d", "1s"]));
    }

    #[test]
    fn test_ab_args() {
        let mut sc = scenario("JSON POST", "POST", "/json");
        sc.body_file = Some(PathBuf::from("payloads/body.json"));
        let mut ab = tool(ToolKind::Ab);
        ab.keep_alive = false;

        let args = ab.args(&framework("Echo", 3002), &sc);
        assert_eq!(
            args,
            vec![
                "-n",
                "5000",
                "-c",
                "64",
                "-p",
                "payloads/body.json",
                "http://127.0.0.1:3002/json"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let mut echo = tool(ToolKind::Wrk);
        echo.program = PathBuf::from("/bin/echo");
        let run = echo
            .run(
                &framework("Gin", 3001),
                &scenario("Simple GET", "GET", "/"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(run.failure.is_none());
        assert!(run.output.contains("-t 4 -c 64 -d 10s --latency"));
        assert!(run.output.contains("http://127.0.0.1:3001/"));
    }

    #[tokio::test]
    async fn test_run_reports_exit_failure() {
        let mut failing = tool(ToolKind::Wrk);
        failing.program = PathBuf::from("/bin/false");
        let run = failing
            .run(
                &framework("Gin", 3001),
                &scenario("Simple GET", "GET", "/"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let failure = run.failure.unwrap();
        assert_eq!(failure.kind, AttemptKind::Exit);
        assert_eq!(failure.message, "exit status 1");
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("slow-wrk");
        std::fs::write(&script, "#!/bin/sh\necho warming up\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let mut slow = tool(ToolKind::Wrk);
        slow.program = script;
        let run = slow
            .run(
                &framework("Gin", 3001),
                &scenario("Simple GET", "GET", "/"),
                Duration::from_millis(500),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let failure = run.failure.unwrap();
        assert_eq!(failure.kind, AttemptKind::Timeout);
        assert!(failure.message.starts_with("context deadline exceeded"));
        assert!(run.output.contains("warming up"));
        // The sleeping grandchild is killed with the tool
        assert!(run.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let mut missing = tool(ToolKind::Wrk);
        missing.program = PathBuf::from("/nonexistent/wrk");
        let err = missing
            .run(
                &framework("Gin", 3001),
                &scenario("Simple GET", "GET", "/"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, AttemptKind::Spawn);
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let mut echo = tool(ToolKind::Wrk);
        echo.program = PathBuf::from("/bin/echo");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = echo
            .run(
                &framework("Gin", 3001),
                &scenario("Simple GET", "GET", "/"),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, AttemptKind::Cancelled);
    }
}
