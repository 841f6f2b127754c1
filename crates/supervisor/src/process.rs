//! OS process launch, exit observation and termination

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::target::TargetSpec;

/// Handle to a launched target process.
///
/// A background task owns the child and publishes its exit description, so
/// any number of holders can wait for the exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Option<String>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit and describe how it exited
    pub async fn wait(&self) -> String {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).clone().unwrap_or_default(),
            Err(_) => "exit status unknown".to_string(),
        };
        exit
    }
}

/// Launch a target in its own process group with `PORT` set
pub fn launch(spec: &TargetSpec, log_dir: Option<&Path>) -> Result<ProcessHandle> {
    if !spec.program.is_file() {
        return Err(SupervisorError::BinaryNotFound {
            name: spec.name.clone(),
            path: spec.program.display().to_string(),
        });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .env("PORT", spec.port.to_string())
        .stdin(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);

    match log_dir {
        Some(dir) => {
            let path = dir.join(format!("{}.log", spec.name));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            cmd.stdout(Stdio::from(file.try_clone()?))
                .stderr(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
        name: spec.name.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
        name: spec.name.clone(),
        reason: "process exited before its pid was read".to_string(),
    })?;

    let (tx, rx) = watch::channel(None);
    let name = spec.name.clone();
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => describe_exit(status),
            Err(e) => format!("wait failed: {}", e),
        };
        debug!("Process {} ({}) exited: {}", pid, name, exit);
        let _ = tx.send(Some(exit));
    });

    info!("Launched {} (pid {}) on port {}", spec.name, pid, spec.port);
    Ok(ProcessHandle { pid, exit: rx })
}

/// Describe an exit status in `exit status N` / `signal: killed` form
pub fn describe_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return format!("exit status {}", code);
    }
    match status.signal() {
        Some(sig) => match Signal::try_from(sig) {
            Ok(Signal::SIGKILL) => "signal: killed".to_string(),
            Ok(Signal::SIGTERM) => "signal: terminated".to_string(),
            Ok(Signal::SIGINT) => "signal: interrupt".to_string(),
            Ok(Signal::SIGSEGV) => "signal: segmentation fault".to_string(),
            Ok(Signal::SIGABRT) => "signal: aborted".to_string(),
            Ok(other) => format!("signal: {}", other.as_str()),
            Err(_) => format!("signal: {}", sig),
        },
        None => "exit status unknown".to_string(),
    }
}

/// SIGTERM the process group, SIGKILL it if still alive after `grace`
pub async fn terminate(name: &str, handle: &ProcessHandle, grace: Duration) {
    if handle.has_exited() {
        return;
    }

    let pid = Pid::from_raw(handle.pid() as i32);
    send(name, pid, Signal::SIGTERM);

    if timeout(grace, handle.wait()).await.is_ok() {
        debug!("{} exited after SIGTERM", name);
        return;
    }

    warn!("Force killing {} after {:?}", name, grace);
    send(name, pid, Signal::SIGKILL);
    if timeout(Duration::from_secs(5), handle.wait()).await.is_err() {
        warn!("{} (pid {}) did not exit after SIGKILL", name, pid);
    }
}

fn send(name: &str, pid: Pid, signal: Signal) {
    if let Err(e) = killpg(pid, signal) {
        debug!("killpg {} for {} failed ({}), signalling pid", signal, name, e);
        if let Err(e) = kill(pid, signal) {
            debug!("Failed to send {} to {}: {}", signal, name, e);
        }
    }
}
