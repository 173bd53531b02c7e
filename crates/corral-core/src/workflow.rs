use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, SandboxId, SessionId, WorkflowRunId};

/// A statically registered workflow: an ordered list of tool steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

/// One step in a workflow definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the workflow. Completed step results are
    /// threaded into later steps' context under this name.
    pub name: String,
    /// Tool to invoke (must be registered with the adapter registry).
    pub tool: String,
    /// Parameters merged under the caller-supplied workflow parameters.
    #[serde(default)]
    pub base_parameters: serde_json::Value,
    /// Consecutive steps sharing a group label run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Dry-run steps produce non-final results; admission is unchanged.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Runtime record of one step within a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub tool: String,
    pub status: StepStatus,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// False for dry-run steps whose results are advisory.
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl WorkflowStep {
    fn pending(def: &StepDefinition) -> Self {
        Self {
            name: def.name.clone(),
            tool: def.tool.clone(),
            status: StepStatus::Pending,
            input: serde_json::Value::Null,
            result: None,
            error: None,
            is_final: !def.dry_run,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn start(&mut self, input: serde_json::Value) {
        self.status = StepStatus::Running;
        self.input = input;
        self.started_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.ended_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
    }
}

/// A run of a named workflow. Created when the run starts, mutated
/// step-by-step, immutable once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub run_id: WorkflowRunId,
    pub workflow_id: String,
    pub correlation_id: CorrelationId,
    pub sandbox_id: SandboxId,
    pub session_id: SessionId,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub total_duration_ms: u64,
}

impl WorkflowExecution {
    pub fn new(
        definition: &WorkflowDefinition,
        correlation_id: CorrelationId,
        sandbox_id: SandboxId,
        session_id: SessionId,
    ) -> Self {
        Self {
            run_id: WorkflowRunId::new(),
            workflow_id: definition.id.clone(),
            correlation_id,
            sandbox_id,
            session_id,
            status: WorkflowStatus::Running,
            steps: definition.steps.iter().map(WorkflowStep::pending).collect(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: None,
            total_duration_ms: 0,
        }
    }

    /// Mark the run failed: every step still pending becomes skipped.
    pub fn fail(&mut self, duration_ms: u64) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.skip();
            }
        }
        self.status = WorkflowStatus::Failed;
        self.ended_at = Some(chrono::Utc::now().to_rfc3339());
        self.total_duration_ms = duration_ms;
    }

    pub fn complete(&mut self, duration_ms: u64) {
        self.status = WorkflowStatus::Completed;
        self.ended_at = Some(chrono::Utc::now().to_rfc3339());
        self.total_duration_ms = duration_ms;
    }

    pub fn is_terminal(&self) -> bool {
        self.status != WorkflowStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "lead_followup".into(),
            name: "Lead follow-up".into(),
            steps: vec![
                StepDefinition {
                    name: "fetch_lead".into(),
                    tool: "crm.lookup".into(),
                    base_parameters: serde_json::json!({}),
                    parallel_group: None,
                    dry_run: false,
                },
                StepDefinition {
                    name: "draft_reply".into(),
                    tool: "llm.generate".into(),
                    base_parameters: serde_json::json!({"tone": "friendly"}),
                    parallel_group: None,
                    dry_run: true,
                },
            ],
        }
    }

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(
            &definition(),
            CorrelationId::new(),
            SandboxId::new(),
            SessionId::new(),
        )
    }

    #[test]
    fn new_execution_has_pending_steps() {
        let exec = execution();
        assert_eq!(exec.status, WorkflowStatus::Running);
        assert_eq!(exec.steps.len(), 2);
        assert!(exec.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(!exec.is_terminal());
    }

    #[test]
    fn dry_run_step_is_not_final() {
        let exec = execution();
        assert!(exec.steps[0].is_final);
        assert!(!exec.steps[1].is_final);
    }

    #[test]
    fn step_lifecycle_complete() {
        let mut exec = execution();
        exec.steps[0].start(serde_json::json!({"lead_id": 7}));
        assert_eq!(exec.steps[0].status, StepStatus::Running);
        assert!(exec.steps[0].started_at.is_some());

        exec.steps[0].complete(serde_json::json!({"name": "Dana"}));
        assert_eq!(exec.steps[0].status, StepStatus::Completed);
        assert!(exec.steps[0].status.is_terminal());
        assert!(exec.steps[0].ended_at.is_some());
    }

    #[test]
    fn fail_skips_pending_steps() {
        let mut exec = execution();
        exec.steps[0].start(serde_json::json!({}));
        exec.steps[0].fail("adapter down");
        exec.fail(42);

        assert_eq!(exec.status, WorkflowStatus::Failed);
        assert_eq!(exec.steps[0].status, StepStatus::Failed);
        assert_eq!(exec.steps[1].status, StepStatus::Skipped);
        assert_eq!(exec.total_duration_ms, 42);
        assert!(exec.is_terminal());
    }

    #[test]
    fn fail_leaves_completed_steps_alone() {
        let mut exec = execution();
        exec.steps[0].start(serde_json::json!({}));
        exec.steps[0].complete(serde_json::json!({"ok": true}));
        exec.steps[1].start(serde_json::json!({}));
        exec.steps[1].fail("boom");
        exec.fail(10);

        assert_eq!(exec.steps[0].status, StepStatus::Completed);
        assert_eq!(exec.steps[1].status, StepStatus::Failed);
    }

    #[test]
    fn status_string_roundtrip() {
        for s in ["pending", "running", "completed", "failed", "skipped"] {
            let parsed: StepStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
    }

    #[test]
    fn execution_serde_roundtrip() {
        let mut exec = execution();
        exec.steps[0].start(serde_json::json!({"a": 1}));
        exec.steps[0].complete(serde_json::json!({"b": 2}));
        let json = serde_json::to_string(&exec).unwrap();
        let parsed: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps[0].status, StepStatus::Completed);
        assert_eq!(parsed.workflow_id, "lead_followup");
    }
}
