//! Restart policy and supervisor timings

use std::path::PathBuf;
use std::time::Duration;
use webbench_common::config::{BenchConfig, ProcessConfig};

/// When and how often a crashed target is relaunched
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Restarts allowed per supervision session
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Poll interval while a target has no process to watch
    pub health_check_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            base_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    pub fn from_config(process: &ProcessConfig) -> Self {
        Self {
            max_restarts: process.max_restarts,
            base_delay: Duration::from_secs(process.restart_delay_seconds),
            backoff_multiplier: process.backoff_multiplier,
            max_delay: Duration::from_secs(process.max_restart_delay_seconds),
            health_check_interval: Duration::from_secs(
                process.health_check_interval_seconds.max(1),
            ),
        }
    }

    /// Delay before the restart that follows `restart_count` earlier ones.
    ///
    /// `base * (1 + restart_count * multiplier)`, never above `max_delay`.
    pub fn restart_delay(&self, restart_count: u32) -> Duration {
        let factor = 1.0 + f64::from(restart_count) * self.backoff_multiplier.max(0.0);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Timings and locations used by the supervisor outside the restart policy
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// SIGTERM grace period for a deliberate stop
    pub stop_grace: Duration,
    /// SIGTERM grace period when forcing a restart
    pub kick_stop_grace: Duration,
    /// Pause between stopping and relaunching on a forced restart
    pub kick_settle: Duration,
    /// Health wait after a forced restart
    pub startup_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Probe timeout while waiting for health
    pub wait_probe_timeout: Duration,
    /// Probe timeout for a one-shot health check
    pub quick_probe_timeout: Duration,
    /// Polls while another restart is in progress
    pub restart_wait_attempts: u32,
    pub restart_wait_interval: Duration,
    /// Upper bound on waiting for monitor tasks during shutdown
    pub shutdown_wait: Duration,
    /// Directory receiving `<target>.log` files
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            kick_stop_grace: Duration::from_secs(5),
            kick_settle: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_millis(100),
            wait_probe_timeout: Duration::from_secs(5),
            quick_probe_timeout: Duration::from_secs(2),
            restart_wait_attempts: 30,
            restart_wait_interval: Duration::from_secs(1),
            shutdown_wait: Duration::from_secs(10),
            log_dir: None,
        }
    }
}

impl SupervisorSettings {
    /// Settings for a validated config. An unusable health interval falls back
    /// to the default.
    pub fn from_config(config: &BenchConfig, log_dir: Option<PathBuf>) -> Self {
        let defaults = Self::default();
        Self {
            stop_grace: Duration::from_secs(config.process.shutdown_timeout_seconds),
            startup_timeout: Duration::from_secs(config.benchmark.health_check_timeout),
            health_poll_interval: config
                .benchmark
                .health_poll_interval()
                .unwrap_or(defaults.health_poll_interval),
            log_dir,
            ..defaults
        }
    }
}
