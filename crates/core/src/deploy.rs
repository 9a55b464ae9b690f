//! Deployment Step Handler: the state machine that drives one deployment
//! step from `started` through artifact download, script execution, and
//! batched log upload to `step-result`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kraken_agent_domain::error::{Error, Result};
use kraken_agent_domain::types::{
    ArtifactMetadata, DeploymentStepTask, ScriptLogLine, StepParameter, VariableType, VariableValue,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control_plane::{ControlPlaneClient, DeployLogBatch, StepResult, StepStatus};
use crate::script_runner;
use crate::token_store::TokenCipher;
use crate::variables;

#[cfg(unix)]
pub const ARTIFACTS_ROOT: &str = "/opt/kraken/Artifacts";
#[cfg(windows)]
pub const ARTIFACTS_ROOT: &str = r"C:\Kraken\Artifacts";

const FLUSH_COUNT_THRESHOLD: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const BATCHER_TICK: Duration = Duration::from_millis(100);

pub struct DeployOutcome {
    pub status: StepStatus,
    pub transcript: String,
}

#[cfg(unix)]
fn wrap_script(resolved: &str) -> String {
    format!("#!/bin/bash\nset -euo pipefail\n( {resolved} )\n")
}

#[cfg(windows)]
fn wrap_script(resolved: &str) -> String {
    format!(
        "$ErrorActionPreference = \"Stop\"\ntry {{ {resolved} }} catch {{ Write-Host 'ERROR: ' + $_.Exception.Message; exit 1 }}\nexit 0\n"
    )
}

fn filename_from_response(response: &reqwest::Response, url: &str) -> String {
    if let Some(value) = response.headers().get(reqwest::header::CONTENT_DISPOSITION) {
        if let Ok(text) = value.to_str() {
            if let Some(idx) = text.find("filename=") {
                let rest = &text[idx + "filename=".len()..];
                let trimmed = rest.trim_matches('"').trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    url.rsplit('/').next().unwrap_or("artifact.bin").to_string()
}

/// Downloads one `SelectArtifact` payload, streaming the response body to
/// disk. Skips the download (but still returns the target dir) if the
/// file already exists.
async fn download_artifact(
    http_client: &reqwest::Client,
    artifacts_root: &Path,
    agent_id: Uuid,
    meta: &ArtifactMetadata,
) -> Result<PathBuf> {
    let target_dir = artifacts_root.join(agent_id.to_string()).join(&meta.name).join(&meta.version);
    tokio::fs::create_dir_all(&target_dir).await?;

    let response = http_client
        .get(&meta.url)
        .send()
        .await
        .map_err(|e| Error::Step(format!("artifact download request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Step(format!("artifact download returned http {}", response.status())));
    }

    let filename = filename_from_response(&response, &meta.url);
    let target_path = target_dir.join(filename);
    if target_path.exists() {
        return Ok(target_dir);
    }

    let mut file = tokio::fs::File::create(&target_path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Step(format!("artifact stream error: {e}")))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(target_dir)
}

/// Resolves artifacts for every `SelectArtifact` parameter, mutating each
/// parameter's `artifact_metadata.base_path` in place, and returns the
/// resolver-ready variable map (`Variables` plus the four
/// `{Name}.{Name|Version|Url|BasePath}` entries per artifact).
async fn prepare_artifacts_and_variables(
    http_client: &reqwest::Client,
    artifacts_root: &Path,
    agent_id: Uuid,
    variables_in: &HashMap<String, VariableValue>,
    step_parameters: &mut [StepParameter],
) -> Result<HashMap<String, VariableValue>> {
    let mut all_variables = variables_in.clone();

    for param in step_parameters.iter_mut() {
        if !param.is_select_artifact() {
            continue;
        }
        let Some(meta) = param.artifact_metadata.as_mut() else {
            continue;
        };
        let target_dir = download_artifact(http_client, artifacts_root, agent_id, meta).await?;
        let base_path = target_dir.to_string_lossy().to_string();
        meta.base_path = Some(base_path.clone());

        let text = |value: String| VariableValue { value, kind: VariableType::Text };
        all_variables.insert(format!("{}.Name", param.name), text(meta.name.clone()));
        all_variables.insert(format!("{}.Version", param.name), text(meta.version.clone()));
        all_variables.insert(format!("{}.Url", param.name), text(meta.url.clone()));
        all_variables.insert(format!("{}.BasePath", param.name), text(base_path));
    }

    Ok(all_variables)
}

async fn flush_pending<C: TokenCipher>(
    control_plane: &ControlPlaneClient<C>,
    deployment_id: &str,
    step_order: i64,
    agent_id: Uuid,
    pending: &mut Vec<ScriptLogLine>,
) {
    if pending.is_empty() {
        return;
    }
    let batch = DeployLogBatch { deployment_id, step_id: step_order, agent_id, logs: pending };
    if control_plane.post_logs(&batch).await {
        pending.clear();
    }
}

/// Buffers lines from the script runner and flushes on count-or-time,
/// never dropping a batch that failed to upload. Returns once `rx`
/// closes, performing one final unconditional flush first.
async fn drive_log_batcher<C: TokenCipher>(
    mut rx: mpsc::Receiver<ScriptLogLine>,
    control_plane: Arc<ControlPlaneClient<C>>,
    deployment_id: String,
    step_order: i64,
    agent_id: Uuid,
) {
    let mut pending: Vec<ScriptLogLine> = Vec::new();
    let mut last_flush = Instant::now();
    let mut ticker = tokio::time::interval(BATCHER_TICK);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(line) => {
                        pending.push(line);
                        if pending.len() >= FLUSH_COUNT_THRESHOLD {
                            flush_pending(&control_plane, &deployment_id, step_order, agent_id, &mut pending).await;
                            last_flush = Instant::now();
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL {
                    flush_pending(&control_plane, &deployment_id, step_order, agent_id, &mut pending).await;
                    last_flush = Instant::now();
                }
            }
        }
    }

    flush_pending(&control_plane, &deployment_id, step_order, agent_id, &mut pending).await;
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_deploy_step<C: TokenCipher>(
    control_plane: Arc<ControlPlaneClient<C>>,
    http_client: &reqwest::Client,
    agent_id: Uuid,
    base_install_root: &Path,
    artifacts_root: &Path,
    mut task: DeploymentStepTask,
    cancel: CancellationToken,
) -> DeployOutcome {
    if !control_plane.put_step_started(&task.deployment_id, task.step_order).await {
        tracing::warn!(deployment_id = %task.deployment_id, step = task.step_order, "report-started failed");
    }

    let prepared = prepare_artifacts_and_variables(
        http_client,
        artifacts_root,
        agent_id,
        &task.variables,
        &mut task.step_parameters,
    )
    .await;

    let (line_tx, line_rx) = mpsc::channel::<ScriptLogLine>(256);
    let batcher = tokio::spawn(drive_log_batcher(
        line_rx,
        control_plane.clone(),
        task.deployment_id.clone(),
        task.step_order,
        agent_id,
    ));

    let run_result = match prepared {
        Ok(all_variables) => {
            let resolved = variables::resolve(&task.script_to_execute, &all_variables);
            let wrapped = wrap_script(&resolved);
            let counter = Arc::new(AtomicU64::new(0));
            script_runner::run(
                &wrapped,
                base_install_root,
                agent_id,
                &task.environment,
                &task.release_version,
                task.step_order,
                &task.variables,
                &task.step_parameters,
                counter,
                line_tx,
                cancel,
            )
            .await
        }
        Err(e) => {
            drop(line_tx);
            Err(e)
        }
    };

    let _ = batcher.await;

    let (status, transcript) = match run_result {
        Ok(transcript) => (StepStatus::Successful, transcript),
        Err(e) => (StepStatus::Failed, format!("step failed: {e}")),
    };

    let step_result = StepResult {
        deployment_id: &task.deployment_id,
        agent_id,
        status,
        step_id: task.step_order,
        logs: &transcript,
    };
    if !control_plane.post_step_result(&step_result).await {
        tracing::warn!(deployment_id = %task.deployment_id, step = task.step_order, "report-finished failed");
    }

    DeployOutcome { status, transcript }
}
