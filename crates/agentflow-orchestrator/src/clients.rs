//! External collaborator interfaces (spec §1, §6.2): typed trait boundaries
//! for every system this crate talks to but does not implement. Swappable
//! for fakes in tests; a `reqwest`-backed implementation is provided for the
//! HTTP-shaped ones.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned an error: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInvokeRequest {
    pub step_id: String,
    pub task_fragment: String,
    pub context: Value,
    pub tools: Vec<Value>,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInvokeResponse {
    pub output: Value,
    #[serde(default)]
    pub captured_insights: Vec<String>,
    #[serde(default)]
    pub next_hint: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// `POST {base_endpoint}/invoke` per §6.2.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(
        &self,
        base_endpoint: &str,
        request: AgentInvokeRequest,
    ) -> Result<AgentInvokeResponse, ClientError>;
}

pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(
        &self,
        base_endpoint: &str,
        request: AgentInvokeRequest,
    ) -> Result<AgentInvokeResponse, ClientError> {
        let deadline = Duration::from_millis(request.deadline_ms);
        let response = tokio::time::timeout(
            deadline,
            self.http
                .post(format!("{base_endpoint}/invoke"))
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| ClientError::Timeout(base_endpoint.to_string()))??;

        if !response.status().is_success() {
            return Err(ClientError::Upstream(format!(
                "agent at {base_endpoint} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Uniform `{server, tool, arguments} -> result` RPC to an external tool
/// server, per §1.
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    async fn call(&self, server: &str, tool: &str, arguments: Value) -> Result<Value, ClientError>;
}

#[derive(Debug, Clone)]
pub struct LlmCompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    /// When set, the provider is asked to constrain output to this schema
    /// (decision nodes, session classification fallback).
    pub structured_output_schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct LlmCompletionResponse {
    pub text: String,
    pub structured: Option<Value>,
}

/// Text-completion RPC with streaming and structured-output modes, per §1.
/// Streaming is modeled as a channel of text deltas; callers that only need
/// the final text use `complete`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmCompletionRequest) -> Result<LlmCompletionResponse, ClientError>;

    async fn stream(
        &self,
        request: LlmCompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<String>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f64,
    pub source: String,
}

/// `query(text, collection) -> ranked chunks`, per §1. Used both for
/// retrieval-augmented agent context and TS's semantic-rank stage.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn query(&self, text: &str, collection: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, ClientError>;
}

/// Posts an approval prompt to an issue tracker / source host and returns
/// the opaque `external_ref`, per §1 and §4.8.
#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn post_approval_prompt(&self, workflow_id: &str, summary: &str) -> Result<String, ClientError>;
}

/// Default `LlmClient` when no provider is configured. Decision nodes and
/// the intake classifier's LLM fallback both degrade to this rather than
/// panicking when the deployment has no LLM wired up yet.
pub struct UnavailableLlmClient;

#[async_trait]
impl LlmClient for UnavailableLlmClient {
    async fn complete(&self, _request: LlmCompletionRequest) -> Result<LlmCompletionResponse, ClientError> {
        Err(ClientError::Upstream("no LlmClient configured".to_string()))
    }

    async fn stream(
        &self,
        _request: LlmCompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<String>, ClientError> {
        Err(ClientError::Upstream("no LlmClient configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAgentClient;

    #[async_trait]
    impl AgentClient for FakeAgentClient {
        async fn invoke(
            &self,
            _base_endpoint: &str,
            request: AgentInvokeRequest,
        ) -> Result<AgentInvokeResponse, ClientError> {
            Ok(AgentInvokeResponse {
                output: serde_json::json!({ "echo": request.task_fragment }),
                captured_insights: vec!["insight-1".to_string()],
                next_hint: None,
                error: None,
            })
        }
    }

    #[tokio::test]
    async fn fake_agent_client_roundtrips() {
        let client = FakeAgentClient;
        let response = client
            .invoke(
                "http://example.local",
                AgentInvokeRequest {
                    step_id: "s1".to_string(),
                    task_fragment: "do the thing".to_string(),
                    context: serde_json::json!({}),
                    tools: vec![],
                    deadline_ms: 1000,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.output["echo"], "do the thing");
        assert_eq!(response.captured_insights, vec!["insight-1".to_string()]);
    }
}
