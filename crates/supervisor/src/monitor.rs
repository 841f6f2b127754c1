//! Per-target crash monitor

use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;
use crate::target::{ManagedTarget, TargetState};

/// Watch a target's process and relaunch it with backoff when it exits.
///
/// Exits when `token` is cancelled, the supervisor shuts down, or the
/// restart budget is exhausted.
pub(crate) async fn watch(
    sup: Supervisor,
    target: Arc<ManagedTarget>,
    token: CancellationToken,
    id: u64,
) {
    let name = target.spec.name.clone();
    let policy = sup.policy().clone();
    let mut pending: Option<String> = None;
    debug!("Monitor {} attached to {}", id, name);

    loop {
        let exit = match pending.take() {
            Some(exit) => exit,
            None => {
                let current = {
                    let rt = target.runtime.lock();
                    rt.process.clone().map(|p| (p, rt.generation))
                };
                let Some((handle, generation)) = current else {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(policy.health_check_interval) => {}
                    }
                    continue;
                };

                let exit = tokio::select! {
                    _ = token.cancelled() => break,
                    exit = handle.wait() => exit,
                };
                if sup.is_shutting_down() || token.is_cancelled() {
                    break;
                }

                let replaced = {
                    let mut rt = target.runtime.lock();
                    if rt.generation == generation {
                        rt.detach();
                        false
                    } else {
                        true
                    }
                };
                if replaced {
                    debug!("{} process was replaced, watching the new one", name);
                    continue;
                }
                exit
            }
        };

        let restart_count = {
            let mut rt = target.runtime.lock();
            if rt.state != TargetState::Restarting {
                rt.state = TargetState::Failed;
                rt.last_error = Some(exit.clone());
            }
            rt.restart_count
        };
        warn!("{} process exited: {}", name, exit);

        if restart_count >= policy.max_restarts {
            error!(
                "{} exceeded maximum restart attempts ({}), giving up",
                name, policy.max_restarts
            );
            break;
        }

        let delay = policy.restart_delay(restart_count);
        info!(
            "Restarting {} in {:?} (attempt {}/{})",
            name,
            delay,
            restart_count + 1,
            policy.max_restarts
        );
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(delay) => {}
        }

        let _guard = target.lifecycle.lock().await;
        if sup.is_shutting_down() || token.is_cancelled() {
            break;
        }
        let relaunched_elsewhere = {
            let mut rt = target.runtime.lock();
            if rt.process.is_some() {
                true
            } else {
                rt.state = TargetState::Restarting;
                rt.restart_count += 1;
                false
            }
        };
        if relaunched_elsewhere {
            debug!("{} was relaunched during backoff", name);
            continue;
        }

        match sup.launch(&target) {
            Ok(handle) => {
                target.runtime.lock().attach(handle);
                info!("Restarted {}", name);
            }
            Err(e) => {
                error!("Failed to restart {}: {}", name, e);
                let reason = e.to_string();
                {
                    let mut rt = target.runtime.lock();
                    rt.state = TargetState::Failed;
                    rt.last_error = Some(reason.clone());
                }
                pending = Some(reason);
            }
        }
    }

    let mut rt = target.runtime.lock();
    if rt.monitor == Some(id) {
        rt.monitor = None;
    }
    debug!("Monitor {} for {} exited", id, name);
}
