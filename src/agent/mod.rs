//! Agent processing seam. The gateway hands every authorized webhook to an
//! [`AgentProcessor`]; the production implementation forwards to an upstream
//! HTTP agent service, tests substitute their own.

use crate::identity::RequestIdentity;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;

/// Everything the agent needs to process one webhook message.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub message: String,
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    /// Workspace-local paths of uploaded media, in arrival order.
    pub media_paths: Vec<PathBuf>,
    pub identity: RequestIdentity,
}

#[async_trait]
pub trait AgentProcessor: Send + Sync {
    /// Process one message to completion and return the reply text.
    async fn process(&self, request: AgentRequest) -> Result<String>;
}

/// Forwards requests to an upstream agent service over HTTP.
pub struct HttpAgentProcessor {
    client: reqwest::Client,
    url: String,
}

impl HttpAgentProcessor {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl AgentProcessor for HttpAgentProcessor {
    async fn process(&self, request: AgentRequest) -> Result<String> {
        let media: Vec<String> = request
            .media_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let body = json!({
            "message": request.message,
            "session_key": request.session_key,
            "channel": request.channel,
            "chat_id": request.chat_id,
            "media": media,
            "business_id": request.identity.business_id,
            "user_id": request.identity.subject,
        });

        let mut builder = self.client.post(&self.url).json(&body);
        // Forward the caller's signed token so the agent can act on their
        // behalf against upstream APIs.
        if let Some(jwt) = &request.identity.jwt_token {
            builder = builder.bearer_auth(jwt);
        }

        let response = builder
            .send()
            .await
            .context("failed to reach agent service")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("agent service returned {status}: {text}");
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .context("agent service returned invalid JSON")?;
        match payload.get("response").and_then(|v| v.as_str()) {
            Some(reply) => Ok(reply.to_string()),
            None => bail!("agent service response missing 'response' field"),
        }
    }
}
