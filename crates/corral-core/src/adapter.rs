use async_trait::async_trait;

use crate::errors::AdapterError;
use crate::ids::{CorrelationId, RequestId, SandboxId, SessionId};

/// Context threaded into every adapter call. Adapters may use it for
/// upstream request tagging but must not mutate orchestrator state.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub sandbox_id: SandboxId,
    pub session_id: SessionId,
    pub correlation_id: CorrelationId,
    pub request_id: RequestId,
    /// Dry-run calls must not perform irreversible side effects upstream.
    pub dry_run: bool,
}

/// Result of one adapter invocation.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    /// Tokens actually consumed, as reported by the external service.
    pub tokens_used: u64,
}

/// Contract for an external tool service (analytics engine, advertising
/// API, LLM provider, ...). The orchestrator calls `invoke` at most once
/// per admitted request unless `is_idempotent` returns true.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool name this adapter serves, e.g. "analytics.query".
    fn name(&self) -> &str;

    /// Whether a repeated invocation with identical parameters is safe.
    /// Governs whether the invoker may retry a retryable failure.
    fn is_idempotent(&self) -> bool {
        false
    }

    async fn invoke(
        &self,
        parameters: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, AdapterError>;
}
