use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use corral_core::adapter::{CallContext, ToolAdapter, ToolOutput};
use corral_core::errors::AdapterError;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    result: serde_json::Value,
    #[serde(default)]
    tokens_used: u64,
}

/// Adapter that forwards tool calls to an external HTTP service. The
/// upstream receives the parameters plus the call context, and replies
/// with `{"result": ..., "tokens_used": n}`.
pub struct HttpToolAdapter {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    api_key: Option<String>,
    idempotent: bool,
}

impl HttpToolAdapter {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
            api_key: None,
            idempotent: false,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Declare the upstream safe to re-invoke with identical parameters.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

#[async_trait]
impl ToolAdapter for HttpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    #[instrument(skip(self, parameters, ctx), fields(tool = %self.name, request_id = %ctx.request_id))]
    async fn invoke(
        &self,
        parameters: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, AdapterError> {
        let body = serde_json::json!({
            "tool": self.name,
            "parameters": parameters,
            "context": {
                "sandbox_id": ctx.sandbox_id,
                "session_id": ctx.session_id,
                "correlation_id": ctx.correlation_id,
                "request_id": ctx.request_id,
                "dry_run": ctx.dry_run,
            },
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout(DEFAULT_HTTP_TIMEOUT)
            } else {
                AdapterError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text));
        }

        let parsed: UpstreamResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidRequest(format!("malformed upstream reply: {e}")))?;

        debug!(tokens_used = parsed.tokens_used, "upstream call succeeded");
        Ok(ToolOutput {
            result: parsed.result,
            tokens_used: parsed.tokens_used,
        })
    }
}
