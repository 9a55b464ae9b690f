use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AgentIdentity, EndpointConfig};

/// On-disk shape of `agentsettings.json` (and its `agentsettings.<env>.json`
/// overlay). Field casing matches the wire examples in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettingsFile {
    #[serde(rename = "Agent")]
    pub agent: AgentSection,
    #[serde(rename = "AgentApi")]
    pub agent_api: UrlSection,
    #[serde(rename = "Auth")]
    pub auth: UrlSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(rename = "Id")]
    pub id: Uuid,
    #[serde(rename = "WorkspaceId")]
    pub workspace_id: String,
    #[serde(rename = "OrganizationId")]
    pub organization_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlSection {
    #[serde(rename = "Url")]
    pub url: String,
}

impl AgentSettingsFile {
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: self.agent.id,
            workspace_id: self.agent.workspace_id.clone(),
            organization_id: self.agent.organization_id.clone(),
        }
    }

    pub fn endpoints(&self) -> EndpointConfig {
        EndpointConfig {
            agent_api_url: self.agent_api.url.clone(),
            auth_url: self.auth.url.clone(),
        }
    }
}

/// Read `agentsettings.json` from `base_path`, then, if `overlay_name` is
/// `Some`, deep-merge `agentsettings.<overlay_name>.json` from the same
/// directory over it.
pub fn load_settings(
    base_path: &std::path::Path,
    overlay_name: Option<&str>,
) -> Result<AgentSettingsFile> {
    let base_text = std::fs::read_to_string(base_path)?;
    let mut merged: Value = serde_json::from_str(&base_text)?;

    if let Some(env) = overlay_name {
        let dir = base_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let overlay_path = dir.join(format!("agentsettings.{env}.json"));
        if overlay_path.exists() {
            let overlay_text = std::fs::read_to_string(&overlay_path)?;
            let overlay: Value = serde_json::from_str(&overlay_text)?;
            merge_json(&mut merged, &overlay);
        }
    }

    serde_json::from_value(merged).map_err(Error::from)
}

/// Recursive `serde_json::Value` merge: objects merge key-by-key, every
/// other value type in `overlay` replaces the corresponding `base` value.
fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                merge_json(base_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
