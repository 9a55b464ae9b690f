//! Control-Plane Client: authenticated HTTP calls against the agent API,
//! with exactly one retry-on-401. URL templates are built with plain
//! `format!`, including the spec's literal no-slash-before-`{deploymentId}`
//! quirk in the `started` URL — preserved bit-exact.

use std::sync::Arc;
use std::time::Duration;

use kraken_agent_domain::types::{AgentIdentity, AgentTask, EndpointConfig, ScriptLogLine};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::auth::AuthTokenManager;
use crate::token_store::{PlaintextCipher, TokenCipher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of `next-task`, mirroring the error handling design's
/// per-status disposition exactly.
#[derive(Debug)]
pub enum NextTaskOutcome {
    Task(AgentTask),
    /// HTTP 204 — no work; caller resets the polling interval.
    NoWork,
    /// HTTP 409 — benign conflict; caller keeps the current status.
    Conflict,
    /// Any other non-2xx; caller marks the agent Offline.
    Offline,
    /// Timeout or connection failure; caller marks the agent Unhealthy.
    NetworkError,
}

#[derive(Debug, Serialize)]
pub struct DeployLogBatch<'a> {
    #[serde(rename = "DeploymentId")]
    pub deployment_id: &'a str,
    #[serde(rename = "StepId")]
    pub step_id: i64,
    #[serde(rename = "AgentId")]
    pub agent_id: uuid::Uuid,
    #[serde(rename = "Logs")]
    pub logs: &'a [ScriptLogLine],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum StepStatus {
    Successful,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct StepResult<'a> {
    #[serde(rename = "DeploymentId")]
    pub deployment_id: &'a str,
    #[serde(rename = "AgentId")]
    pub agent_id: uuid::Uuid,
    #[serde(rename = "Status")]
    pub status: StepStatus,
    #[serde(rename = "StepId")]
    pub step_id: i64,
    #[serde(rename = "Logs")]
    pub logs: &'a str,
}

pub struct ControlPlaneClient<C: TokenCipher = PlaintextCipher> {
    identity: AgentIdentity,
    endpoints: EndpointConfig,
    auth: Arc<AuthTokenManager<C>>,
}

enum SendOutcome {
    Response(reqwest::Response),
    NetworkError,
}

impl<C: TokenCipher> ControlPlaneClient<C> {
    pub fn new(identity: AgentIdentity, endpoints: EndpointConfig, auth: Arc<AuthTokenManager<C>>) -> Self {
        Self { identity, endpoints, auth }
    }

    fn agent_scope_path(&self) -> String {
        format!(
            "{}/organization/{}/workspaces/{}/agents/{}",
            self.endpoints.agent_api_base(),
            self.identity.organization_id,
            self.identity.workspace_id,
            self.identity.agent_id
        )
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> SendOutcome {
        self.auth.ensure_valid().await;
        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(_) => return SendOutcome::NetworkError,
        };

        let first = self.issue(&client, method.clone(), url, body).await;
        let response = match first {
            Ok(response) => response,
            Err(_) => return SendOutcome::NetworkError,
        };

        if response.status() == StatusCode::UNAUTHORIZED && self.auth.refresh().await {
            let retry_client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
                Ok(client) => client,
                Err(_) => return SendOutcome::NetworkError,
            };
            return match self.issue(&retry_client, method, url, body).await {
                Ok(response) => SendOutcome::Response(response),
                Err(_) => SendOutcome::NetworkError,
            };
        }

        SendOutcome::Response(response)
    }

    async fn issue(
        &self,
        client: &reqwest::Client,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> reqwest::Result<reqwest::Response> {
        let mut builder = client.request(method, url).bearer_auth(self.auth.access_token());
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    pub async fn get_next_task(&self, metrics_envelope: &Value) -> NextTaskOutcome {
        let url = format!("{}/next-task", self.agent_scope_path());
        match self.send(Method::POST, &url, Some(metrics_envelope)).await {
            SendOutcome::NetworkError => NextTaskOutcome::NetworkError,
            SendOutcome::Response(response) => match response.status() {
                StatusCode::NO_CONTENT => NextTaskOutcome::NoWork,
                StatusCode::CONFLICT => NextTaskOutcome::Conflict,
                status if status.is_success() => match response.json::<AgentTask>().await {
                    Ok(task) => NextTaskOutcome::Task(task),
                    Err(_) => NextTaskOutcome::Offline,
                },
                _ => NextTaskOutcome::Offline,
            },
        }
    }

    /// Returns `true` on HTTP success; callers log and retain on failure
    /// per the spec's "logs are never dropped" flush contract.
    pub async fn post_logs(&self, batch: &DeployLogBatch<'_>) -> bool {
        let url = format!("{}/post-logs", self.agent_scope_path());
        let body = serde_json::to_value(batch).unwrap_or(Value::Null);
        matches!(
            self.send(Method::POST, &url, Some(&body)).await,
            SendOutcome::Response(response) if response.status().is_success()
        )
    }

    pub async fn post_step_result(&self, result: &StepResult<'_>) -> bool {
        let url = format!("{}/step-result", self.agent_scope_path());
        let body = serde_json::to_value(result).unwrap_or(Value::Null);
        matches!(
            self.send(Method::POST, &url, Some(&body)).await,
            SendOutcome::Response(response) if response.status().is_success()
        )
    }

    /// Note: no `/` before `{deploymentId}`, preserved bit-exact per spec.
    pub async fn put_step_started(&self, deployment_id: &str, step_order: i64) -> bool {
        let url = format!(
            "{}/deployment{deployment_id}/step/{step_order}/started",
            self.agent_scope_path()
        );
        matches!(
            self.send(Method::PUT, &url, None).await,
            SendOutcome::Response(response) if response.status().is_success()
        )
    }

    pub async fn put_set_offline(&self) -> bool {
        let url = format!("{}/set-offline", self.agent_scope_path());
        matches!(
            self.send(Method::PUT, &url, None).await,
            SendOutcome::Response(response) if response.status().is_success()
        )
    }
}
