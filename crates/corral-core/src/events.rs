use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, SandboxId, SessionId};

/// Lifecycle events emitted by the tool invoker and workflow engine.
/// Every event carries the correlation id of the request that produced it,
/// so a consumer can stitch together one logical execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "tool_start")]
    ToolStart {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        session_id: SessionId,
        tool_name: String,
        estimated_tokens: u64,
    },

    #[serde(rename = "tool_complete")]
    ToolComplete {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        session_id: SessionId,
        tool_name: String,
        tokens_used: u64,
        duration_ms: u64,
    },

    #[serde(rename = "tool_error")]
    ToolError {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        session_id: SessionId,
        tool_name: String,
        error: String,
    },

    #[serde(rename = "rate_limit_exceeded")]
    RateLimitExceeded {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        session_id: SessionId,
        hourly_usage: u64,
        hourly_limit: u64,
        daily_usage: u64,
        daily_limit: u64,
    },

    #[serde(rename = "workflow_start")]
    WorkflowStart {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        step_count: usize,
    },

    #[serde(rename = "workflow_step_start")]
    WorkflowStepStart {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        step_name: String,
        step_index: usize,
    },

    #[serde(rename = "workflow_step_complete")]
    WorkflowStepComplete {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        step_name: String,
        step_index: usize,
        duration_ms: u64,
    },

    #[serde(rename = "workflow_step_error")]
    WorkflowStepError {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        step_name: String,
        step_index: usize,
        error: String,
    },

    #[serde(rename = "workflow_complete")]
    WorkflowComplete {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        duration_ms: u64,
    },

    #[serde(rename = "workflow_failed")]
    WorkflowFailed {
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        workflow_id: String,
        failed_step: String,
        error: String,
    },
}

impl ExecutionEvent {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::ToolStart { correlation_id, .. }
            | Self::ToolComplete { correlation_id, .. }
            | Self::ToolError { correlation_id, .. }
            | Self::RateLimitExceeded { correlation_id, .. }
            | Self::WorkflowStart { correlation_id, .. }
            | Self::WorkflowStepStart { correlation_id, .. }
            | Self::WorkflowStepComplete { correlation_id, .. }
            | Self::WorkflowStepError { correlation_id, .. }
            | Self::WorkflowComplete { correlation_id, .. }
            | Self::WorkflowFailed { correlation_id, .. } => correlation_id,
        }
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        match self {
            Self::ToolStart { sandbox_id, .. }
            | Self::ToolComplete { sandbox_id, .. }
            | Self::ToolError { sandbox_id, .. }
            | Self::RateLimitExceeded { sandbox_id, .. }
            | Self::WorkflowStart { sandbox_id, .. }
            | Self::WorkflowStepStart { sandbox_id, .. }
            | Self::WorkflowStepComplete { sandbox_id, .. }
            | Self::WorkflowStepError { sandbox_id, .. }
            | Self::WorkflowComplete { sandbox_id, .. }
            | Self::WorkflowFailed { sandbox_id, .. } => sandbox_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolStart { .. } => "tool_start",
            Self::ToolComplete { .. } => "tool_complete",
            Self::ToolError { .. } => "tool_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::WorkflowStart { .. } => "workflow_start",
            Self::WorkflowStepStart { .. } => "workflow_step_start",
            Self::WorkflowStepComplete { .. } => "workflow_step_complete",
            Self::WorkflowStepError { .. } => "workflow_step_error",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowFailed { .. } => "workflow_failed",
        }
    }

    /// All event type tags, for subscriber filters and wire docs.
    pub const ALL_TYPES: &'static [&'static str] = &[
        "tool_start",
        "tool_complete",
        "tool_error",
        "rate_limit_exceeded",
        "workflow_start",
        "workflow_step_start",
        "workflow_step_complete",
        "workflow_step_error",
        "workflow_complete",
        "workflow_failed",
    ];
}

/// Replay log entry kinds (stored in SQLite, keyed by correlation id).
/// Covers every admission decision and lifecycle transition so a past
/// execution can be reconstructed exactly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayKind {
    AdmissionGranted,
    AdmissionDenied,
    ToolStart,
    ToolComplete,
    ToolError,
    WorkflowStart,
    WorkflowStepStart,
    WorkflowStepComplete,
    WorkflowStepError,
    WorkflowComplete,
    WorkflowFailed,
}

impl std::fmt::Display for ReplayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

impl std::str::FromStr for ReplayKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown replay kind: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_start() -> ExecutionEvent {
        ExecutionEvent::ToolStart {
            correlation_id: CorrelationId::new(),
            sandbox_id: SandboxId::new(),
            session_id: SessionId::new(),
            tool_name: "analytics.query".into(),
            estimated_tokens: 120,
        }
    }

    #[test]
    fn event_accessors() {
        let evt = tool_start();
        assert_eq!(evt.event_type(), "tool_start");
        assert!(evt.correlation_id().as_str().starts_with("corr_"));
        assert!(evt.sandbox_id().as_str().starts_with("sbx_"));
    }

    #[test]
    fn serde_tag_matches_event_type() {
        let events = vec![
            tool_start(),
            ExecutionEvent::WorkflowFailed {
                correlation_id: CorrelationId::new(),
                sandbox_id: SandboxId::new(),
                workflow_id: "lead_followup".into(),
                failed_step: "draft_reply".into(),
                error: "adapter unavailable".into(),
            },
            ExecutionEvent::RateLimitExceeded {
                correlation_id: CorrelationId::new(),
                sandbox_id: SandboxId::new(),
                session_id: SessionId::new(),
                hourly_usage: 999,
                hourly_limit: 1000,
                daily_usage: 999,
                daily_limit: 10000,
            },
        ];
        for evt in &events {
            let json = serde_json::to_value(evt).unwrap();
            assert_eq!(json["type"], evt.event_type());
        }
    }

    #[test]
    fn serde_roundtrip() {
        let evt = tool_start();
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "tool_start");
        assert_eq!(parsed.correlation_id(), evt.correlation_id());
    }

    #[test]
    fn all_types_covers_every_variant() {
        assert_eq!(ExecutionEvent::ALL_TYPES.len(), 10);
        assert!(ExecutionEvent::ALL_TYPES.contains(&"workflow_step_error"));
    }

    #[test]
    fn replay_kind_display_roundtrip() {
        assert_eq!(ReplayKind::AdmissionDenied.to_string(), "admission_denied");
        assert_eq!(ReplayKind::WorkflowStepError.to_string(), "workflow_step_error");
        let parsed: ReplayKind = "tool_complete".parse().unwrap();
        assert_eq!(parsed, ReplayKind::ToolComplete);
        assert!("bogus".parse::<ReplayKind>().is_err());
    }
}
