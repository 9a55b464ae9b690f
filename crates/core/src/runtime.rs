//! Agent Runtime / Polling Loop: the single long-running task that drives
//! every other component. Grounded in the teacher's `NodeClient::run`
//! reconnect loop — `tokio::select!` between the main operation and a
//! shutdown signal — generalized from websocket-reconnect semantics to
//! HTTP-poll semantics.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kraken_agent_domain::types::{AgentIdentity, AgentState, AgentStatus, AgentTaskType, CleanupTask, DeploymentStepTask};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cleanup;
use crate::control_plane::{ControlPlaneClient, NextTaskOutcome};
use crate::deploy;
use crate::metrics;
use crate::token_store::TokenCipher;
use crate::update::{self, UpdateTask};

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
const DISPATCH_POLLING_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_SIGNAL_POLL: Duration = Duration::from_secs(1);

/// Jitter: a uniform integer in [-1, +2] seconds added to the base
/// interval, floored at 1 second. `seed` varies per call so the runtime
/// doesn't need a full PRNG dependency for a two-bit range.
fn jittered_interval(base: Duration, seed: u64) -> Duration {
    let offsets: [i64; 4] = [-1, 0, 1, 2];
    let offset = offsets[(seed % offsets.len() as u64) as usize];
    let base_secs = base.as_secs() as i64;
    let jittered = (base_secs + offset).max(1);
    Duration::from_secs(jittered as u64)
}

pub struct RuntimePaths {
    pub base_install_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub installations_root: PathBuf,
    pub update_work_dir: PathBuf,
    pub working_dir: PathBuf,
}

pub struct AgentRuntime<C: TokenCipher> {
    identity: AgentIdentity,
    control_plane: Arc<ControlPlaneClient<C>>,
    http_client: reqwest::Client,
    paths: RuntimePaths,
    process_start: Instant,
    status: Mutex<AgentStatus>,
    state: Mutex<AgentState>,
}

fn shutdown_signal_path(working_dir: &Path) -> PathBuf {
    working_dir.join("shutdown.signal")
}

impl<C: TokenCipher> AgentRuntime<C> {
    pub fn new(identity: AgentIdentity, control_plane: Arc<ControlPlaneClient<C>>, paths: RuntimePaths) -> Result<Self, kraken_agent_domain::error::Error> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| kraken_agent_domain::error::Error::Http(e.to_string()))?;
        Ok(Self {
            identity,
            control_plane,
            http_client,
            paths,
            process_start: Instant::now(),
            status: Mutex::new(AgentStatus::Healthy),
            state: Mutex::new(AgentState::Waiting),
        })
    }

    fn status(&self) -> AgentStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.lock() = status;
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock() = state;
    }

    async fn build_metrics_envelope(&self) -> serde_json::Value {
        let metrics = metrics::sample(self.process_start).await;
        serde_json::json!({
            "Version": env!("CARGO_PKG_VERSION"),
            "Status": self.status(),
            "State": *self.state.lock(),
            "CpuUsagePercent": metrics.cpu_usage_percent,
            "RamUsageMb": metrics.ram_usage_mb,
            "RamTotalMb": metrics.ram_total_mb,
            "DiskTotalGb": metrics.disk_total_gb,
            "DiskFreeGb": metrics.disk_free_gb,
            "AgentUptime": metrics.agent_uptime,
            "Ip": metrics.ip,
            "Os": metrics.os,
        })
    }

    async fn dispatch(&self, task: kraken_agent_domain::types::AgentTask) -> bool {
        match task.task_type {
            AgentTaskType::Deploy => {
                let deploy_task: DeploymentStepTask = match serde_json::from_value(task.payload) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "unable to decode deploy task payload");
                        return true;
                    }
                };
                deploy::handle_deploy_step(
                    self.control_plane.clone(),
                    &self.http_client,
                    self.identity.agent_id,
                    &self.paths.base_install_root,
                    &self.paths.artifacts_root,
                    deploy_task,
                    CancellationToken::new(),
                )
                .await;
                true
            }
            AgentTaskType::Cleanup => {
                let cleanup_task: CleanupTask = match serde_json::from_value(task.payload) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "unable to decode cleanup task payload");
                        return true;
                    }
                };
                cleanup::handle_cleanup(
                    &cleanup_task,
                    self.identity.agent_id,
                    &self.paths.artifacts_root,
                    &self.paths.installations_root,
                );
                true
            }
            AgentTaskType::Update => {
                let update_task: UpdateTask = match serde_json::from_value(task.payload) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "unable to decode update task payload");
                        return true;
                    }
                };
                self.set_status(AgentStatus::Updating);
                if let Err(e) = update::handle_update(&update_task, &self.identity, &self.paths.update_work_dir).await {
                    tracing::warn!(error = %e, "update handler failed");
                }
                false
            }
        }
    }

    /// One poll-dispatch-or-recover iteration. Returns the interval the
    /// caller should sleep before the next iteration, and whether a
    /// clean-exit-worthy Update was just dispatched.
    async fn step(&self) -> (Duration, bool) {
        // `get_next_task` calls `ensure_valid` internally before issuing
        // the request, so the proactive refresh happens as part of the
        // call below rather than as a separate step here.
        let envelope = self.build_metrics_envelope().await;
        match self.control_plane.get_next_task(&envelope).await {
            NextTaskOutcome::Task(task) => {
                self.set_state(AgentState::Busy);
                self.set_status(AgentStatus::Healthy);
                let should_continue = self.dispatch(task).await;
                if !should_continue {
                    return (DISPATCH_POLLING_INTERVAL, true);
                }
                self.set_state(AgentState::Waiting);
                self.set_status(AgentStatus::Healthy);
                (DISPATCH_POLLING_INTERVAL, false)
            }
            NextTaskOutcome::NoWork => {
                if self.status() == AgentStatus::Offline {
                    self.set_status(AgentStatus::Healthy);
                }
                (DEFAULT_POLLING_INTERVAL, false)
            }
            NextTaskOutcome::Conflict => (DEFAULT_POLLING_INTERVAL, false),
            NextTaskOutcome::Offline => {
                self.set_status(AgentStatus::Offline);
                (DEFAULT_POLLING_INTERVAL, false)
            }
            NextTaskOutcome::NetworkError => {
                self.set_status(AgentStatus::Unhealthy);
                self.set_state(AgentState::Waiting);
                (DEFAULT_POLLING_INTERVAL, false)
            }
        }
    }

    /// Runs until the shutdown signal file appears or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let seed = AtomicI64::new(0);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if shutdown_signal_path(&self.paths.working_dir).exists() {
                let _ = std::fs::remove_file(shutdown_signal_path(&self.paths.working_dir));
                self.control_plane.put_set_offline().await;
                break;
            }

            let (interval, should_exit) = self.step().await;
            if should_exit {
                break;
            }

            let n = seed.fetch_add(1, Ordering::SeqCst) as u64;
            let sleep_for = jittered_interval(interval, n);
            let deadline = Instant::now() + sleep_for;

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if shutdown_signal_path(&self.paths.working_dir).exists() {
                    let _ = std::fs::remove_file(shutdown_signal_path(&self.paths.working_dir));
                    self.control_plane.put_set_offline().await;
                    return;
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(SHUTDOWN_SIGNAL_POLL.min(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)))) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_floored_at_one_second() {
        for seed in 0..4u64 {
            let result = jittered_interval(Duration::from_secs(1), seed);
            assert!(result.as_secs() >= 1);
        }
    }

    #[test]
    fn jitter_stays_within_documented_band() {
        for seed in 0..100u64 {
            let result = jittered_interval(Duration::from_secs(30), seed).as_secs() as i64;
            assert!((29..=32).contains(&result));
        }
    }
}
