//! Seam between the executor and the process supervisor

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webbench_supervisor::{Supervisor, SupervisorError};

type ControlResult = std::result::Result<(), SupervisorError>;

/// Lifecycle operations the runner needs from the target fleet
#[async_trait]
pub trait TargetControl: Send + Sync {
    async fn start_all(&self) -> ControlResult;

    async fn wait_until_healthy(&self, cancel: &CancellationToken, limit: Duration)
        -> ControlResult;

    /// Make sure a target is up and healthy, restarting it if needed
    async fn ensure_running(&self, name: &str) -> ControlResult;

    async fn is_healthy(&self, name: &str) -> bool;

    async fn shutdown(&self);
}

#[async_trait]
impl TargetControl for Supervisor {
    async fn start_all(&self) -> ControlResult {
        Supervisor::start_all(self).await
    }

    async fn wait_until_healthy(
        &self,
        cancel: &CancellationToken,
        limit: Duration,
    ) -> ControlResult {
        Supervisor::wait_until_healthy(self, cancel, limit).await
    }

    async fn ensure_running(&self, name: &str) -> ControlResult {
        Supervisor::ensure_running(self, name).await
    }

    async fn is_healthy(&self, name: &str) -> bool {
        Supervisor::is_healthy(self, name).await
    }

    async fn shutdown(&self) {
        Supervisor::shutdown(self).await
    }
}
