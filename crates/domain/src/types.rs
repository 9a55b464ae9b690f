use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Loaded once at startup from `agentsettings.json`; never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: Uuid,
    pub workspace_id: String,
    pub organization_id: String,
}

/// Absolute HTTPS bases for the two control-plane surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub agent_api_url: String,
    pub auth_url: String,
}

impl EndpointConfig {
    /// Bases are used literally except for a stripped trailing slash.
    pub fn agent_api_base(&self) -> &str {
        self.agent_api_url.trim_end_matches('/')
    }

    pub fn auth_base(&self) -> &str {
        self.auth_url.trim_end_matches('/')
    }
}

/// The single process-global auth state, owned by the Auth Token Manager.
///
/// `Debug` is hand-written to keep tokens out of logs.
#[derive(Clone, Default)]
pub struct AuthState {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: String,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("access_token", &redact(&self.access_token))
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AgentStatus {
    Healthy,
    Unhealthy,
    Offline,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AgentState {
    Waiting,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AgentTaskType {
    Deploy,
    Update,
    Cleanup,
}

/// Tagged union returned by `next-task`. `payload` is decoded by the
/// handler selected from `task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentTask {
    pub id: Uuid,
    #[serde(rename = "Type")]
    pub task_type: AgentTaskType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VariableType {
    Text,
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VariableValue {
    pub value: String,
    #[serde(rename = "Type")]
    pub kind: VariableType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactMetadata {
    pub name: String,
    pub version: String,
    pub url: String,
    pub base_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepParameter {
    pub name: String,
    pub control_type: String,
    pub value: Option<String>,
    #[serde(default)]
    pub artifact_metadata: Option<ArtifactMetadata>,
}

impl StepParameter {
    pub fn is_select_artifact(&self) -> bool {
        self.control_type == "SelectArtifact"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentStepTask {
    pub agent_id: Uuid,
    pub deployment_id: String,
    pub step_order: i64,
    pub environment: String,
    pub release_version: String,
    pub variables: HashMap<String, VariableValue>,
    pub step_parameters: Vec<StepParameter>,
    pub script_to_execute: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Invariant: within one step, `line` values are strictly increasing and
/// gap-free across both direct-appended and runner-produced lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScriptLogLine {
    pub line: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub environment: Option<Uuid>,
    pub retain_deployed_versions: i64,
    pub retain_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CleanupTask {
    pub retention_policies: Vec<RetentionPolicy>,
}
