//! Supervised targets

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use webbench_common::FrameworkConfig;

use crate::process::ProcessHandle;

/// How to launch and reach one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    /// Registry key (framework config key)
    pub name: String,
    pub display_name: String,
    pub port: u16,
    /// Base URL the health probe is sent to
    pub url: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl TargetSpec {
    /// Target for a configured framework binary at `<build_dir>/<binary_name>`
    pub fn from_framework(key: &str, framework: &FrameworkConfig, build_dir: &Path) -> Self {
        let program = build_dir.join(&framework.binary_name);
        let program = if program.is_absolute() {
            program
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&program))
                .unwrap_or(program)
        };

        Self {
            name: key.to_string(),
            display_name: framework.name.clone(),
            port: framework.port,
            url: framework.url.clone(),
            program,
            args: framework.args.clone(),
            env: framework.env.clone(),
        }
    }
}

/// Lifecycle state of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Stopped,
    Starting,
    Running,
    Failed,
    Restarting,
}

impl TargetState {
    /// Process launched, not necessarily answering yet
    pub fn is_active(&self) -> bool {
        matches!(self, TargetState::Running | TargetState::Starting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Stopped => "stopped",
            TargetState::Starting => "starting",
            TargetState::Running => "running",
            TargetState::Failed => "failed",
            TargetState::Restarting => "restarting",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a target
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub name: String,
    pub display_name: String,
    pub url: String,
    pub state: TargetState,
    pub pid: Option<u32>,
    /// Restarts performed by the monitor this session
    pub restart_count: u32,
    /// Restarts forced by availability checks
    pub forced_restarts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub monitoring: bool,
}

/// Mutable per-target fields, guarded by the target's own lock
pub(crate) struct TargetRuntime {
    pub state: TargetState,
    pub process: Option<ProcessHandle>,
    /// Bumped whenever `process` is replaced or cleared
    pub generation: u64,
    pub restart_count: u32,
    pub forced_restarts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Cancelled when the target is stopped or the supervisor shuts down
    pub cancel: CancellationToken,
    /// Identifies the monitor task currently attached, if any
    pub monitor: Option<u64>,
}

impl TargetRuntime {
    /// Install a freshly launched process
    pub fn attach(&mut self, handle: ProcessHandle) {
        self.process = Some(handle);
        self.generation += 1;
        self.state = TargetState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Remove the current process handle, if any
    pub fn detach(&mut self) -> Option<ProcessHandle> {
        self.generation += 1;
        self.process.take()
    }
}

/// A target owned by the supervisor registry
pub(crate) struct ManagedTarget {
    pub spec: TargetSpec,
    pub runtime: Mutex<TargetRuntime>,
    /// Serializes start, stop and relaunch of this target
    pub lifecycle: tokio::sync::Mutex<()>,
}

impl ManagedTarget {
    pub fn new(spec: TargetSpec, cancel: CancellationToken) -> Self {
        Self {
            spec,
            runtime: Mutex::new(TargetRuntime {
                state: TargetState::Stopped,
                process: None,
                generation: 0,
                restart_count: 0,
                forced_restarts: 0,
                last_error: None,
                started_at: None,
                cancel,
                monitor: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> TargetStatus {
        let rt = self.runtime.lock();
        TargetStatus {
            name: self.spec.name.clone(),
            display_name: self.spec.display_name.clone(),
            url: self.spec.url.clone(),
            state: rt.state,
            pid: rt.process.as_ref().map(|p| p.pid()),
            restart_count: rt.restart_count,
            forced_restarts: rt.forced_restarts,
            last_error: rt.last_error.clone(),
            started_at: rt.started_at,
            monitoring: rt.monitor.is_some(),
        }
    }

    /// Process present, not yet exited, and state running or starting
    pub fn is_spawned(&self) -> bool {
        let rt = self.runtime.lock();
        rt.state.is_active() && rt.process.as_ref().map_or(false, |p| !p.has_exited())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_framework() {
        let fw = FrameworkConfig {
            name: "Gin".into(),
            port: 3001,
            url: "http://127.0.0.1:3001".into(),
            binary_name: "gin-server".into(),
            args: vec!["--quiet".into()],
            ..Default::default()
        };
        let spec = TargetSpec::from_framework("gin", &fw, Path::new("/opt/build"));

        assert_eq!(spec.name, "gin");
        assert_eq!(spec.display_name, "Gin");
        assert_eq!(spec.program, PathBuf::from("/opt/build/gin-server"));
        assert_eq!(spec.args, vec!["--quiet"]);
    }

    #[test]
    fn test_relative_build_dir_is_made_absolute() {
        let fw = FrameworkConfig {
            binary_name: "echo-server".into(),
            ..Default::default()
        };
        let spec = TargetSpec::from_framework("echo", &fw, Path::new("build"));
        assert!(spec.program.is_absolute());
        assert!(spec.program.ends_with("build/echo-server"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TargetState::Restarting.to_string(), "restarting");
        assert!(TargetState::Starting.is_active());
        assert!(!TargetState::Failed.is_active());
    }
}
