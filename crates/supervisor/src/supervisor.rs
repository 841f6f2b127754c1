//! Target registry and lifecycle operations

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webbench_common::BenchConfig;

use crate::error::{Result, SupervisorError};
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::monitor;
use crate::policy::{RestartPolicy, SupervisorSettings};
use crate::process::{self, ProcessHandle};
use crate::target::{ManagedTarget, TargetRuntime, TargetSpec, TargetState, TargetStatus};

/// Supervises a fixed set of targets.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    targets: RwLock<HashMap<String, Arc<ManagedTarget>>>,
    policy: RestartPolicy,
    settings: SupervisorSettings,
    probe: Arc<dyn HealthProbe>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    next_monitor: AtomicU64,
}

impl Supervisor {
    pub fn new(
        specs: Vec<TargetSpec>,
        policy: RestartPolicy,
        settings: SupervisorSettings,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let targets = specs
            .into_iter()
            .map(|spec| {
                let name = spec.name.clone();
                let target = ManagedTarget::new(spec, shutdown.child_token());
                (name, Arc::new(target))
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                targets: RwLock::new(targets),
                policy,
                settings,
                probe,
                shutting_down: AtomicBool::new(false),
                shutdown,
                monitors: Mutex::new(Vec::new()),
                next_monitor: AtomicU64::new(1),
            }),
        }
    }

    /// Supervisor for every configured framework, probing over HTTP
    pub fn from_config(config: &BenchConfig, log_dir: Option<PathBuf>) -> Result<Self> {
        let specs = config
            .frameworks
            .iter()
            .map(|(key, fw)| TargetSpec::from_framework(key, fw, &config.process.build_dir))
            .collect();

        Ok(Self::new(
            specs,
            RestartPolicy::from_config(&config.process),
            SupervisorSettings::from_config(config, log_dir),
            Arc::new(HttpHealthProbe::new()?),
        ))
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.inner.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Registered target names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.targets.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn target(&self, name: &str) -> Result<Arc<ManagedTarget>> {
        self.inner
            .targets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::TargetNotFound(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Option<TargetStatus> {
        self.target(name).ok().map(|t| t.status())
    }

    pub fn statuses(&self) -> Vec<TargetStatus> {
        self.names()
            .iter()
            .filter_map(|name| self.status(name))
            .collect()
    }

    pub(crate) fn launch(&self, target: &ManagedTarget) -> Result<ProcessHandle> {
        process::launch(&target.spec, self.inner.settings.log_dir.as_deref())
    }

    fn spawn_monitor(&self, target: &Arc<ManagedTarget>, rt: &mut TargetRuntime) {
        let id = self.inner.next_monitor.fetch_add(1, Ordering::SeqCst);
        rt.monitor = Some(id);
        let handle = tokio::spawn(monitor::watch(
            self.clone(),
            Arc::clone(target),
            rt.cancel.clone(),
            id,
        ));

        let mut monitors = self.inner.monitors.lock();
        monitors.retain(|h| !h.is_finished());
        monitors.push(handle);
    }

    /// Launch a target and attach a monitor.
    ///
    /// Returns once the process is spawned, not once it is healthy.
    pub async fn start(&self, name: &str) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let target = self.target(name)?;
        let _guard = target.lifecycle.lock().await;

        {
            let mut rt = target.runtime.lock();
            if rt.state.is_active() {
                return Err(SupervisorError::AlreadyActive {
                    name: name.to_string(),
                    state: rt.state,
                });
            }
            // New supervision session
            rt.cancel.cancel();
            rt.cancel = self.inner.shutdown.child_token();
            rt.monitor = None;
            rt.state = TargetState::Starting;
            rt.restart_count = 0;
            rt.forced_restarts = 0;
            rt.last_error = None;
        }

        let handle = match self.launch(&target) {
            Ok(handle) => handle,
            Err(e) => {
                let mut rt = target.runtime.lock();
                rt.state = TargetState::Failed;
                rt.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let mut rt = target.runtime.lock();
        rt.attach(handle);
        self.spawn_monitor(&target, &mut rt);
        info!(
            "Started {} ({}) on port {}",
            target.spec.display_name, name, target.spec.port
        );
        Ok(())
    }

    /// Stop a target: SIGTERM, then SIGKILL after the grace period. Idempotent.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let target = self.target(name)?;
        let _guard = target.lifecycle.lock().await;

        let handle = {
            let mut rt = target.runtime.lock();
            if rt.state == TargetState::Stopped && rt.process.is_none() {
                return Ok(());
            }
            rt.cancel.cancel();
            rt.detach()
        };

        if let Some(handle) = handle {
            process::terminate(name, &handle, self.inner.settings.stop_grace).await;
        }

        target.runtime.lock().state = TargetState::Stopped;
        info!("Stopped {}", name);
        Ok(())
    }

    /// Start every target concurrently, reporting all failures
    pub async fn start_all(&self) -> Result<()> {
        let names = self.names();
        info!("Starting {} targets", names.len());

        let results = join_all(names.iter().map(|name| self.start(name))).await;
        let errors: Vec<SupervisorError> = results.into_iter().filter_map(|r| r.err()).collect();
        for e in &errors {
            error!("{}", e);
        }
        SupervisorError::aggregate(errors)?;

        info!("All targets started");
        Ok(())
    }

    /// Stop every target concurrently, reporting all failures
    pub async fn stop_all(&self) -> Result<()> {
        let names = self.names();
        info!("Stopping {} targets", names.len());

        let results = join_all(names.iter().map(|name| self.stop(name))).await;
        let errors: Vec<SupervisorError> = results.into_iter().filter_map(|r| r.err()).collect();
        for e in &errors {
            error!("{}", e);
        }
        SupervisorError::aggregate(errors)
    }

    /// Poll every target's health endpoint until it answers or `limit` passes
    pub async fn wait_until_healthy(&self, cancel: &CancellationToken, limit: Duration) -> Result<()> {
        let targets: Vec<Arc<ManagedTarget>> =
            self.names().iter().filter_map(|n| self.target(n).ok()).collect();
        info!("Waiting up to {:?} for {} targets to become healthy", limit, targets.len());

        let results = join_all(
            targets
                .iter()
                .map(|t| self.await_healthy(t, limit, Some(cancel))),
        )
        .await;
        let errors: Vec<SupervisorError> = results.into_iter().filter_map(|r| r.err()).collect();
        for e in &errors {
            error!("{}", e);
        }
        SupervisorError::aggregate(errors)?;

        info!("All targets healthy");
        Ok(())
    }

    async fn await_healthy(
        &self,
        target: &ManagedTarget,
        limit: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let settings = &self.inner.settings;
        let deadline = Instant::now() + limit;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self
                .inner
                .probe
                .probe(&target.spec.url, settings.wait_probe_timeout)
                .await
            {
                Ok(()) => {
                    debug!("{} healthy after {} checks", target.spec.name, attempts);
                    return Ok(());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for {} to become healthy", target.spec.name);
                    }
                    debug!("Health check for {} failed: {}", target.spec.name, e);
                }
            }

            if Instant::now() >= deadline {
                return Err(SupervisorError::HealthCheck {
                    name: target.spec.name.clone(),
                    attempts,
                });
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(SupervisorError::Cancelled),
                        _ = sleep(settings.health_poll_interval) => {}
                    }
                }
                None => sleep(settings.health_poll_interval).await,
            }
        }
    }

    async fn probe_target(&self, target: &ManagedTarget) -> bool {
        target.is_spawned()
            && self
                .inner
                .probe
                .probe(&target.spec.url, self.inner.settings.quick_probe_timeout)
                .await
                .is_ok()
    }

    /// Process launched and state running or starting, regardless of health
    pub fn is_spawned(&self, name: &str) -> bool {
        self.target(name).map(|t| t.is_spawned()).unwrap_or(false)
    }

    /// Spawned and answering its health endpoint
    pub async fn is_healthy(&self, name: &str) -> bool {
        match self.target(name) {
            Ok(target) => self.probe_target(&target).await,
            Err(_) => false,
        }
    }

    /// Make sure a target is up before it is tested.
    ///
    /// Healthy targets are left alone. A target the monitor is already
    /// restarting is polled for a bounded time. Anything else is stopped and
    /// relaunched synchronously, outside the monitor's backoff.
    pub async fn ensure_running(&self, name: &str) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let target = self.target(name)?;
        if self.probe_target(&target).await {
            return Ok(());
        }

        let settings = &self.inner.settings;
        let state = target.runtime.lock().state;
        if state == TargetState::Restarting {
            info!("{} is restarting, waiting for it", name);
            for _ in 0..settings.restart_wait_attempts {
                sleep(settings.restart_wait_interval).await;
                if self.probe_target(&target).await {
                    return Ok(());
                }
            }
            return Err(SupervisorError::RestartTimeout {
                name: name.to_string(),
                waited: settings.restart_wait_interval * settings.restart_wait_attempts,
            });
        }

        self.force_restart(&target).await?;
        self.await_healthy(&target, settings.startup_timeout, None)
            .await
    }

    async fn force_restart(&self, target: &Arc<ManagedTarget>) -> Result<()> {
        let name = &target.spec.name;
        let settings = &self.inner.settings;
        let _guard = target.lifecycle.lock().await;
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        // Another caller may have recovered it while we waited for the lock
        if self.probe_target(target).await {
            return Ok(());
        }

        warn!("Forcing restart of {}", name);
        let old = {
            let mut rt = target.runtime.lock();
            rt.state = TargetState::Restarting;
            rt.forced_restarts += 1;
            rt.detach()
        };
        if let Some(handle) = old {
            process::terminate(name, &handle, settings.kick_stop_grace).await;
        }
        sleep(settings.kick_settle).await;

        let handle = match self.launch(target) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Forced restart of {} failed: {}", name, e);
                let mut rt = target.runtime.lock();
                rt.state = TargetState::Failed;
                rt.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let mut rt = target.runtime.lock();
        rt.attach(handle);
        if rt.monitor.is_none() {
            if rt.cancel.is_cancelled() {
                rt.cancel = self.inner.shutdown.child_token();
            }
            self.spawn_monitor(target, &mut rt);
        }
        info!("Relaunched {} (forced restart #{})", name, rt.forced_restarts);
        Ok(())
    }

    /// Stop everything and wait (bounded) for monitor tasks to finish
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!("Shutting down supervisor");

        if let Err(e) = self.stop_all().await {
            warn!("Errors while stopping targets: {}", e);
        }
        self.inner.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.monitors.lock());
        let wait = self.inner.settings.shutdown_wait;
        if timeout(wait, join_all(handles)).await.is_err() {
            warn!("Monitor tasks did not exit within {:?}", wait);
        }
        info!("Supervisor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::shell_spec;
    use async_trait::async_trait;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    struct StaticProbe(bool);

    #[async_trait]
    impl HealthProbe for StaticProbe {
        async fn probe(&self, _url: &str, _timeout: Duration) -> std::result::Result<(), String> {
            if self.0 {
                Ok(())
            } else {
                Err("connection refused".to_string())
            }
        }
    }

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 3,
            base_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(20),
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            stop_grace: Duration::from_secs(2),
            kick_stop_grace: Duration::from_secs(1),
            kick_settle: Duration::from_millis(10),
            startup_timeout: Duration::from_millis(500),
            health_poll_interval: Duration::from_millis(20),
            wait_probe_timeout: Duration::from_millis(100),
            quick_probe_timeout: Duration::from_millis(100),
            restart_wait_attempts: 3,
            restart_wait_interval: Duration::from_millis(20),
            shutdown_wait: Duration::from_secs(2),
            log_dir: None,
        }
    }

    fn supervisor(specs: Vec<TargetSpec>, policy: RestartPolicy, healthy: bool) -> Supervisor {
        Supervisor::new(specs, policy, fast_settings(), Arc::new(StaticProbe(healthy)))
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_crash_loop_stops_at_max_restarts() {
        let sup = supervisor(vec![shell_spec("crashy", "exit 3")], fast_policy(), false);
        sup.start("crashy").await.unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = sup.status("crashy").unwrap();
            seen.push(status.restart_count);
            if !status.monitoring {
                break;
            }
            assert!(Instant::now() < deadline, "monitor never gave up");
            sleep(Duration::from_millis(5)).await;
        }

        let status = sup.status("crashy").unwrap();
        assert_eq!(status.restart_count, 3);
        assert_eq!(status.state, TargetState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("exit status 3"));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(!sup.is_spawned("crashy"));

        // No further restarts once the budget is spent
        sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.status("crashy").unwrap().restart_count, 3);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_stop() {
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], fast_policy(), true);
        sup.start("sleeper").await.unwrap();

        assert!(sup.is_spawned("sleeper"));
        assert!(sup.is_healthy("sleeper").await);
        let status = sup.status("sleeper").unwrap();
        assert_eq!(status.state, TargetState::Running);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());

        sup.stop("sleeper").await.unwrap();
        let status = sup.status("sleeper").unwrap();
        assert_eq!(status.state, TargetState::Stopped);
        assert!(status.pid.is_none());
        assert!(!sup.is_healthy("sleeper").await);

        // Idempotent
        sup.stop("sleeper").await.unwrap();
        wait_until("monitor exit", || !sup.status("sleeper").unwrap().monitoring).await;
        assert_eq!(sup.status("sleeper").unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], fast_policy(), true);
        sup.start("sleeper").await.unwrap();

        let err = sup.start("sleeper").await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyActive { state: TargetState::Running, .. }
        ));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_and_missing_targets() {
        let mut ghost = shell_spec("ghost", "");
        ghost.program = PathBuf::from("/nonexistent/ghost-server");
        let sup = supervisor(vec![ghost], fast_policy(), true);

        assert!(matches!(
            sup.start("nope").await,
            Err(SupervisorError::TargetNotFound(_))
        ));
        assert!(matches!(
            sup.start("ghost").await,
            Err(SupervisorError::BinaryNotFound { .. })
        ));
        assert_eq!(sup.status("ghost").unwrap().state, TargetState::Failed);
        assert!(!sup.is_healthy("nope").await);
    }

    #[tokio::test]
    async fn test_start_all_aggregates_errors() {
        let mut a = shell_spec("a-missing", "");
        a.program = PathBuf::from("/nonexistent/a");
        let mut b = shell_spec("b-missing", "");
        b.program = PathBuf::from("/nonexistent/b");
        let ok = shell_spec("c-ok", "exec sleep 30");
        let sup = supervisor(vec![a, b, ok], fast_policy(), true);

        match sup.start_all().await {
            Err(SupervisorError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
        assert!(sup.is_spawned("c-ok"));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out_and_cancels() {
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], fast_policy(), false);
        sup.start_all().await.unwrap();

        let cancel = CancellationToken::new();
        let err = sup
            .wait_until_healthy(&cancel, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::HealthCheck { .. }));

        cancel.cancel();
        let err = sup
            .wait_until_healthy(&cancel, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_running_noop_when_healthy() {
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], fast_policy(), true);
        sup.start("sleeper").await.unwrap();
        let pid = sup.status("sleeper").unwrap().pid;

        sup.ensure_running("sleeper").await.unwrap();
        let status = sup.status("sleeper").unwrap();
        assert_eq!(status.forced_restarts, 0);
        assert_eq!(status.pid, pid);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_running_forces_restart_of_crashed_target() {
        let policy = RestartPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..fast_policy()
        };
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], policy, true);
        sup.start("sleeper").await.unwrap();
        let old_pid = sup.status("sleeper").unwrap().pid.unwrap();

        killpg(Pid::from_raw(old_pid as i32), Signal::SIGKILL).unwrap();
        wait_until("crash detected", || {
            sup.status("sleeper").unwrap().state == TargetState::Failed
        })
        .await;
        assert_eq!(
            sup.status("sleeper").unwrap().last_error.as_deref(),
            Some("signal: killed")
        );

        sup.ensure_running("sleeper").await.unwrap();

        let status = sup.status("sleeper").unwrap();
        assert_eq!(status.state, TargetState::Running);
        assert_eq!(status.forced_restarts, 1);
        assert_eq!(status.restart_count, 0);
        assert_ne!(status.pid, Some(old_pid));
        assert!(sup.is_spawned("sleeper"));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_running_fails_when_never_healthy() {
        let sup = supervisor(vec![shell_spec("sleeper", "exec sleep 30")], fast_policy(), false);
        sup.start("sleeper").await.unwrap();

        let err = sup.ensure_running("sleeper").await.unwrap_err();
        assert!(matches!(err, SupervisorError::HealthCheck { .. }));
        assert_eq!(sup.status("sleeper").unwrap().forced_restarts, 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let sup = supervisor(
            vec![
                shell_spec("one", "exec sleep 30"),
                shell_spec("two", "exec sleep 30"),
            ],
            fast_policy(),
            true,
        );
        sup.start_all().await.unwrap();
        sup.shutdown().await;

        for status in sup.statuses() {
            assert_eq!(status.state, TargetState::Stopped);
            assert!(!status.monitoring);
        }
        assert!(matches!(
            sup.start("one").await,
            Err(SupervisorError::ShuttingDown)
        ));
        assert!(matches!(
            sup.ensure_running("one").await,
            Err(SupervisorError::ShuttingDown)
        ));
    }
}
