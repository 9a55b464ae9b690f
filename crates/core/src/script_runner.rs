//! Script Runner: materializes a script body to disk, spawns it, and
//! concurrently drains stdout/stderr into line-classified
//! [`ScriptLogLine`]s with a shared monotonic line counter — generalized
//! from a node-sdk-style ping/writer/reader triple of cooperating tasks
//! to a stdout-drain/stderr-drain/exit-wait triple here, joined with
//! `tokio::select!`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use kraken_agent_domain::error::{Error, Result};
use kraken_agent_domain::types::{LogLevel, ScriptLogLine, StepParameter, VariableValue};
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(unix)]
pub const BASE_INSTALL_ROOT: &str = "/opt/kraken/Installations";
#[cfg(windows)]
pub const BASE_INSTALL_ROOT: &str = r"C:\Kraken\Installations";

/// Replaces any character unsafe for a filename with `_`, collapsing
/// consecutive runs into one.
pub fn sanitize_environment(env: &str) -> String {
    let unsafe_chars = Regex::new(r#"[^A-Za-z0-9.\-]"#).unwrap();
    let replaced = unsafe_chars.replace_all(env, "_");
    let collapse_runs = Regex::new(r"_+").unwrap();
    collapse_runs.replace_all(&replaced, "_").to_string()
}

pub fn install_root(
    base_root: &Path,
    agent_id: Uuid,
    environment: &str,
    release_version: &str,
    step_order: i64,
) -> PathBuf {
    base_root
        .join(agent_id.to_string())
        .join(sanitize_environment(environment))
        .join(release_version)
        .join("script")
        .join(step_order.to_string())
}

#[cfg(unix)]
fn script_filename() -> &'static str {
    "deploy.sh"
}
#[cfg(windows)]
fn script_filename() -> &'static str {
    "deploy.ps1"
}

fn build_command(script_path: &Path) -> tokio::process::Command {
    #[cfg(unix)]
    {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg(script_path);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = tokio::process::Command::new("powershell");
        cmd.args(["-ExecutionPolicy", "Bypass", "-File"]).arg(script_path);
        cmd
    }
}

/// Env vars injected into the subprocess: every `Variables` entry under
/// its own bare key, plus four (artifact) or one (scalar) key per
/// `StepParameter`, each prefixed `Kraken.Step.{Name}`.
pub fn build_env_vars(
    variables: &HashMap<String, VariableValue>,
    step_parameters: &[StepParameter],
) -> Vec<(String, String)> {
    let mut env = Vec::new();
    for (key, value) in variables {
        env.push((key.clone(), value.value.clone()));
    }
    for param in step_parameters {
        if param.is_select_artifact() {
            if let Some(meta) = &param.artifact_metadata {
                env.push((format!("Kraken.Step.{}.Name", param.name), meta.name.clone()));
                env.push((format!("Kraken.Step.{}.Version", param.name), meta.version.clone()));
                env.push((format!("Kraken.Step.{}.Url", param.name), meta.url.clone()));
                env.push((
                    format!("Kraken.Step.{}.BasePath", param.name),
                    meta.base_path.clone().unwrap_or_default(),
                ));
            }
        } else {
            env.push((format!("Kraken.Step.{}", param.name), param.value.clone().unwrap_or_default()));
        }
    }
    env
}

fn classify_level(line: &str, default: LogLevel) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fail") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("info") {
        LogLevel::Info
    } else {
        default
    }
}

async fn drain_stream<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    default_level: LogLevel,
    counter: Arc<AtomicU64>,
    tx: mpsc::Sender<ScriptLogLine>,
    transcript: Arc<Mutex<Vec<(u64, String)>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(raw)) = lines.next_line().await {
        let level = classify_level(&raw, default_level);
        let line_no = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = ScriptLogLine { line: line_no, timestamp: Utc::now(), level, message: raw.clone() };
        transcript.lock().push((line_no, raw));
        if tx.send(entry).await.is_err() {
            break;
        }
    }
}

/// Writes (if absent), spawns, and streams a wrapped script body.
/// Returns the concatenated transcript ordered by `Line`.
pub async fn run(
    script_body: &str,
    base_root: &Path,
    agent_id: Uuid,
    environment: &str,
    release_version: &str,
    step_order: i64,
    variables: &HashMap<String, VariableValue>,
    step_parameters: &[StepParameter],
    line_counter: Arc<AtomicU64>,
    line_tx: mpsc::Sender<ScriptLogLine>,
    cancel: CancellationToken,
) -> Result<String> {
    let root = install_root(base_root, agent_id, environment, release_version, step_order);
    std::fs::create_dir_all(&root)?;
    let script_path = root.join(script_filename());

    if !script_path.exists() {
        std::fs::write(&script_path, script_body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms)?;
        }
    }

    let mut command = build_command(&script_path);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    for (key, value) in build_env_vars(variables, step_parameters) {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| Error::Step(format!("failed to spawn script: {e}")))?;
    let stdout = child.stdout.take().ok_or_else(|| Error::Step("script stdout not captured".into()))?;
    let stderr = child.stderr.take().ok_or_else(|| Error::Step("script stderr not captured".into()))?;

    let transcript = Arc::new(Mutex::new(Vec::new()));

    let stdout_task = tokio::spawn(drain_stream(
        stdout,
        LogLevel::Info,
        line_counter.clone(),
        line_tx.clone(),
        transcript.clone(),
    ));
    let stderr_task = tokio::spawn(drain_stream(stderr, LogLevel::Error, line_counter, line_tx, transcript.clone()));

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        status = child.wait() => {
            let _ = status.map_err(|e| Error::Step(format!("script wait failed: {e}")))?;
        }
    }

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let mut lines = transcript.lock().clone();
    lines.sort_by_key(|(line_no, _)| *line_no);
    Ok(lines.into_iter().map(|(_, message)| message).collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_agent_domain::types::VariableType;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_environment("prod/east:1"), "prod_east_1");
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize_environment("a///b"), "a_b");
    }

    #[test]
    fn sanitize_leaves_safe_characters() {
        assert_eq!(sanitize_environment("prod-1.east"), "prod-1.east");
    }

    #[test]
    fn install_root_layout() {
        let agent_id = Uuid::new_v4();
        let root = install_root(Path::new("/opt/kraken/Installations"), agent_id, "prod east", "1.2.3", 4);
        assert_eq!(
            root,
            PathBuf::from(format!("/opt/kraken/Installations/{agent_id}/prod_east/1.2.3/script/4"))
        );
    }

    #[test]
    fn classify_level_error_beats_warn() {
        assert_eq!(classify_level("WARN then ERROR occurred", LogLevel::Info), LogLevel::Error);
    }

    #[test]
    fn classify_level_defaults_to_stream_default() {
        assert_eq!(classify_level("just a line", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_level("just a line", LogLevel::Error), LogLevel::Error);
    }

    #[test]
    fn build_env_vars_includes_scalar_and_artifact_parameters() {
        let mut variables = HashMap::new();
        variables.insert(
            "GREETING".to_string(),
            VariableValue { value: "hi".to_string(), kind: VariableType::Text },
        );
        let params = vec![
            StepParameter {
                name: "myapp".to_string(),
                control_type: "SelectArtifact".to_string(),
                value: None,
                artifact_metadata: Some(kraken_agent_domain::types::ArtifactMetadata {
                    name: "myapp".to_string(),
                    version: "1.2.3".to_string(),
                    url: "https://example.com/myapp.zip".to_string(),
                    base_path: Some("/opt/kraken/Artifacts/agent/myapp/1.2.3".to_string()),
                }),
            },
            StepParameter {
                name: "Mode".to_string(),
                control_type: "Text".to_string(),
                value: Some("fast".to_string()),
                artifact_metadata: None,
            },
        ];
        let env = build_env_vars(&variables, &params);
        assert!(env.contains(&("GREETING".to_string(), "hi".to_string())));
        assert!(env.contains(&("Kraken.Step.myapp.Version".to_string(), "1.2.3".to_string())));
        assert!(env.contains(&(
            "Kraken.Step.myapp.BasePath".to_string(),
            "/opt/kraken/Artifacts/agent/myapp/1.2.3".to_string()
        )));
        assert!(env.contains(&("Kraken.Step.Mode".to_string(), "fast".to_string())));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn run_streams_lines_with_monotonic_gap_free_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(32);
        let counter = Arc::new(AtomicU64::new(0));
        let script = "#!/bin/bash\nset -euo pipefail\necho 'line one'\necho 'WARN: line two' 1>&2\necho 'line three'\n";

        let variables = HashMap::new();
        let params = Vec::new();
        let transcript = run(
            script,
            dir.path(),
            agent_id,
            "prod",
            "1.0.0",
            1,
            &variables,
            &params,
            counter,
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!transcript.is_empty());

        let mut received = Vec::new();
        while let Some(line) = rx.recv().await {
            received.push(line.line);
        }

        let mut sorted = received.clone();
        sorted.sort();
        let expected: Vec<u64> = (1..=sorted.len() as u64).collect();
        assert_eq!(sorted, expected);
    }
}
