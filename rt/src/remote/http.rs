//! REST adapter for a real remote server.
//!
//! Maps the [`RemoteClient`] capability onto the server's HTTP surface.
//! Status mapping lives here and nowhere else: connection errors,
//! timeouts and 5xx responses become [`RemoteError::Transient`], every
//! other non-success becomes [`RemoteError::Fatal`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    ClientFactory, ProcessCall, ProcessCompletion, ProcessProbe, RemoteClient, RemoteError, SessionInfo,
};

/// Connection settings for one configured instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfig {
    /// Base URL, e.g. `https://tm1.example.com:8010`
    pub base_url: String,

    /// Environment variable holding the API credential
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    3_600_000
}

/// Factory producing HTTP-backed clients from instance configuration.
pub struct HttpClientFactory {
    instances: HashMap<String, InstanceConfig>,
}

impl HttpClientFactory {
    pub fn new(instances: HashMap<String, InstanceConfig>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn connect(&self, instance: &str, session_tag: &str) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        let config = self
            .instances
            .get(instance)
            .ok_or_else(|| RemoteError::Fatal(format!("instance '{instance}' is not configured")))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| RemoteError::Fatal(format!("environment variable {var} not set")))?,
            ),
            None => None,
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| RemoteError::Fatal(format!("http client: {e}")))?;

        let mut client = HttpRemoteClient {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
            session_id: None,
        };

        // Register the session context up front so the exclusive-mode
        // registry sees this connection under its tag.
        let response = client
            .post_json("/api/sessions", &json!({ "context": session_tag }))
            .await?;
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("malformed session response: {e}")))?;
        client.session_id = Some(created.id);

        debug!(instance, session_tag, "Connected");
        Ok(Arc::new(client))
    }
}

struct HttpRemoteClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SessionCreated {
    id: String,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionEntry>,
}

#[derive(Deserialize)]
struct SessionEntry {
    id: String,
    #[serde(default)]
    context: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    members: Vec<String>,
}

impl HttpRemoteClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {status}: {body}");
        if status.is_server_error() {
            Err(RemoteError::Transient(message))
        } else {
            Err(RemoteError::Fatal(message))
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, RemoteError> {
        self.send(self.request(reqwest::Method::POST, path).json(body)).await
    }
}

fn classify_reqwest(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Fatal(err.to_string())
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn execute_process(&self, call: &ProcessCall) -> Result<ProcessCompletion, RemoteError> {
        let parameters: serde_json::Map<String, serde_json::Value> = call
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        let body = json!({
            "invocation_id": call.invocation_id,
            "session_context": call.session_tag,
            "parameters": parameters,
            "timeout_sec": call.timeout.map(|d| d.as_secs()),
        });

        let response = self
            .post_json(&format!("/api/processes/{}/execute", call.process), &body)
            .await?;
        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("malformed execute response: {e}")))?;

        match parsed.status.as_str() {
            "success" => Ok(ProcessCompletion::Success),
            "minor_errors" => Ok(ProcessCompletion::MinorErrors),
            "failed" => Ok(ProcessCompletion::Failed {
                message: parsed.message.unwrap_or_else(|| "process failed".to_string()),
            }),
            other => Err(RemoteError::Fatal(format!("unknown completion status '{other}'"))),
        }
    }

    async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), RemoteError> {
        self.post_json(&format!("/api/invocations/{invocation_id}/cancel"), &json!({}))
            .await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RemoteError> {
        let response = self.send(self.request(reqwest::Method::GET, "/api/sessions")).await?;
        let parsed: SessionsResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("malformed sessions response: {e}")))?;
        Ok(parsed
            .sessions
            .into_iter()
            .map(|s| SessionInfo { id: s.id, context: s.context })
            .collect())
    }

    async fn end_session(&self, session_id: &str) -> Result<(), RemoteError> {
        self.send(self.request(reqwest::Method::DELETE, &format!("/api/sessions/{session_id}")))
            .await?;
        Ok(())
    }

    async fn expand_members(&self, expression: &str) -> Result<Vec<String>, RemoteError> {
        let response = self
            .post_json("/api/members/expand", &json!({ "expression": expression }))
            .await?;
        let parsed: MembersResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("malformed members response: {e}")))?;
        Ok(parsed.members)
    }

    async fn probe_process(&self, process: &str) -> Result<ProcessProbe, RemoteError> {
        let builder = self.request(reqwest::Method::GET, &format!("/api/processes/{process}"));
        match self.send(builder).await {
            Ok(_) => Ok(ProcessProbe::Exists),
            Err(RemoteError::Fatal(msg)) if msg.starts_with("HTTP 404") => Ok(ProcessProbe::NotFound),
            Err(e) => Err(e),
        }
    }
}
