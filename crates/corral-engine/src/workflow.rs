use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use corral_core::events::{ExecutionEvent, ReplayKind};
use corral_core::ids::{CorrelationId, SessionId};
use corral_core::workflow::{StepDefinition, WorkflowDefinition, WorkflowExecution};
use corral_store::replay::ReplayRepo;
use corral_store::sessions::SessionRepo;
use corral_store::usage_log::OperationType;
use corral_store::workflows::WorkflowRunRepo;
use corral_telemetry::MetricsRecorder;

use crate::bus::EventBus;
use crate::error::EngineError;
use crate::invoker::{InvokeRequest, ToolInvoker};

/// Statically registered workflow definitions, built at startup.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.workflows.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowRequest {
    pub session_id: SessionId,
    pub workflow_id: String,
    /// Caller parameters, merged over each step's base parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Correlate the run with an outer operation; a fresh id is minted
    /// when absent.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Runs registered workflows step by step through the tool invoker.
/// Every step transition is checkpointed, so a crash leaves the last
/// known state in the store. A failed step fails the run; steps that
/// never ran are marked skipped.
pub struct WorkflowEngine {
    invoker: Arc<ToolInvoker>,
    workflows: Arc<WorkflowRegistry>,
    runs: Arc<WorkflowRunRepo>,
    sessions: Arc<SessionRepo>,
    replay: Arc<ReplayRepo>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRecorder>,
}

impl WorkflowEngine {
    pub fn new(
        invoker: Arc<ToolInvoker>,
        workflows: Arc<WorkflowRegistry>,
        runs: Arc<WorkflowRunRepo>,
        sessions: Arc<SessionRepo>,
        replay: Arc<ReplayRepo>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            invoker,
            workflows,
            runs,
            sessions,
            replay,
            bus,
            metrics,
        }
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, workflow_id = %request.workflow_id))]
    pub async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> Result<WorkflowExecution, EngineError> {
        let definition = self
            .workflows
            .get(&request.workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(request.workflow_id.clone()))?
            .clone();

        let session = self.sessions.get(&request.session_id)?;
        if !session.is_active {
            return Err(EngineError::Validation(format!(
                "session {} has ended",
                request.session_id
            )));
        }

        let correlation_id = request.correlation_id.clone().unwrap_or_default();
        let mut execution = WorkflowExecution::new(
            &definition,
            correlation_id.clone(),
            session.sandbox_id.clone(),
            session.id.clone(),
        );
        self.runs.save(&execution)?;

        self.bus.publish(&ExecutionEvent::WorkflowStart {
            correlation_id: correlation_id.clone(),
            sandbox_id: session.sandbox_id.clone(),
            workflow_id: definition.id.clone(),
            step_count: definition.steps.len(),
        });
        self.replay.append(
            &correlation_id,
            ReplayKind::WorkflowStart,
            serde_json::json!({
                "workflow_id": definition.id,
                "run_id": execution.run_id,
                "step_count": definition.steps.len(),
            }),
        )?;

        let started = Instant::now();
        let mut context = serde_json::Map::new();
        let mut failed: Option<(String, String)> = None;

        let mut index = 0;
        while index < definition.steps.len() {
            let group = consecutive_group(&definition.steps, index);
            let batch = index..index + group;
            index += group;

            // Mark the whole batch running, then launch it and apply
            // results in step order.
            let mut inputs = Vec::with_capacity(group);
            for step_index in batch.clone() {
                let step_def = &definition.steps[step_index];
                let input = step_input(step_def, &request.parameters, &context);
                execution.steps[step_index].start(input.clone());
                self.emit_step_start(&execution, step_index)?;
                inputs.push(input);
            }
            self.runs.save(&execution)?;

            let futures: Vec<_> = batch
                .clone()
                .map(|step_index| {
                    self.run_step(
                        execution.session_id.clone(),
                        execution.correlation_id.clone(),
                        &definition.steps[step_index],
                        inputs[step_index - batch.start].clone(),
                    )
                })
                .collect();
            let results = futures::future::join_all(futures).await;

            for (offset, result) in results.into_iter().enumerate() {
                let step_index = batch.start + offset;
                let step_name = execution.steps[step_index].name.clone();
                match result {
                    Ok((result_value, step_duration_ms)) => {
                        execution.steps[step_index].complete(result_value.clone());
                        context.insert(step_name, result_value);
                        self.emit_step_complete(&execution, step_index, step_duration_ms)?;
                    }
                    Err(err) => {
                        let message = err.to_string();
                        execution.steps[step_index].fail(message.clone());
                        self.emit_step_error(&execution, step_index, &message)?;
                        if failed.is_none() {
                            failed = Some((step_name, message));
                        }
                    }
                }
            }
            self.runs.save(&execution)?;

            if failed.is_some() {
                break;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match failed {
            Some((failed_step, error)) => {
                execution.fail(duration_ms);
                self.bus.publish(&ExecutionEvent::WorkflowFailed {
                    correlation_id: correlation_id.clone(),
                    sandbox_id: execution.sandbox_id.clone(),
                    workflow_id: execution.workflow_id.clone(),
                    failed_step: failed_step.clone(),
                    error: error.clone(),
                });
                self.replay.append(
                    &correlation_id,
                    ReplayKind::WorkflowFailed,
                    serde_json::json!({"failed_step": failed_step, "error": error, "duration_ms": duration_ms}),
                )?;
                self.metrics.increment_counter("workflows_failed", 1);
                warn!(workflow_id = %execution.workflow_id, failed_step, "workflow failed");
            }
            None => {
                execution.complete(duration_ms);
                self.bus.publish(&ExecutionEvent::WorkflowComplete {
                    correlation_id: correlation_id.clone(),
                    sandbox_id: execution.sandbox_id.clone(),
                    workflow_id: execution.workflow_id.clone(),
                    duration_ms,
                });
                self.replay.append(
                    &correlation_id,
                    ReplayKind::WorkflowComplete,
                    serde_json::json!({"duration_ms": duration_ms}),
                )?;
                self.metrics.increment_counter("workflows_completed", 1);
                self.metrics
                    .observe("workflow_duration_ms", duration_ms as f64);
                info!(workflow_id = %execution.workflow_id, duration_ms, "workflow completed");
            }
        }
        self.runs.save(&execution)?;

        Ok(execution)
    }

    async fn run_step(
        &self,
        session_id: SessionId,
        correlation_id: CorrelationId,
        step_def: &StepDefinition,
        input: serde_json::Value,
    ) -> Result<(serde_json::Value, u64), EngineError> {
        let outcome = self
            .invoker
            .execute_as(
                InvokeRequest {
                    session_id,
                    tool: step_def.tool.clone(),
                    parameters: input,
                    dry_run: step_def.dry_run,
                    estimated_tokens: None,
                    correlation_id: Some(correlation_id),
                },
                OperationType::WorkflowStep,
            )
            .await?;
        Ok((outcome.result, outcome.duration_ms))
    }

    fn emit_step_start(
        &self,
        execution: &WorkflowExecution,
        step_index: usize,
    ) -> Result<(), EngineError> {
        let step = &execution.steps[step_index];
        self.bus.publish(&ExecutionEvent::WorkflowStepStart {
            correlation_id: execution.correlation_id.clone(),
            sandbox_id: execution.sandbox_id.clone(),
            workflow_id: execution.workflow_id.clone(),
            step_name: step.name.clone(),
            step_index,
        });
        self.replay.append(
            &execution.correlation_id,
            ReplayKind::WorkflowStepStart,
            serde_json::json!({"step_name": step.name, "step_index": step_index, "tool": step.tool}),
        )?;
        Ok(())
    }

    fn emit_step_complete(
        &self,
        execution: &WorkflowExecution,
        step_index: usize,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        let step = &execution.steps[step_index];
        self.bus.publish(&ExecutionEvent::WorkflowStepComplete {
            correlation_id: execution.correlation_id.clone(),
            sandbox_id: execution.sandbox_id.clone(),
            workflow_id: execution.workflow_id.clone(),
            step_name: step.name.clone(),
            step_index,
            duration_ms,
        });
        self.replay.append(
            &execution.correlation_id,
            ReplayKind::WorkflowStepComplete,
            serde_json::json!({
                "step_name": step.name,
                "step_index": step_index,
                "duration_ms": duration_ms,
                "is_final": step.is_final,
            }),
        )?;
        Ok(())
    }

    fn emit_step_error(
        &self,
        execution: &WorkflowExecution,
        step_index: usize,
        error: &str,
    ) -> Result<(), EngineError> {
        let step = &execution.steps[step_index];
        self.bus.publish(&ExecutionEvent::WorkflowStepError {
            correlation_id: execution.correlation_id.clone(),
            sandbox_id: execution.sandbox_id.clone(),
            workflow_id: execution.workflow_id.clone(),
            step_name: step.name.clone(),
            step_index,
            error: error.to_string(),
        });
        self.replay.append(
            &execution.correlation_id,
            ReplayKind::WorkflowStepError,
            serde_json::json!({"step_name": step.name, "step_index": step_index, "error": error}),
        )?;
        Ok(())
    }
}

/// How many steps starting at `index` belong to one execution batch.
/// Consecutive steps sharing a parallel group label run together; a step
/// without a label runs alone.
fn consecutive_group(steps: &[StepDefinition], index: usize) -> usize {
    match &steps[index].parallel_group {
        None => 1,
        Some(label) => steps[index..]
            .iter()
            .take_while(|s| s.parallel_group.as_ref() == Some(label))
            .count(),
    }
}

/// Build one step's input: base parameters, overlaid with the caller's
/// workflow parameters, plus completed step results under "context".
fn step_input(
    step: &StepDefinition,
    caller: &serde_json::Value,
    context: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let mut merged = match &step.base_parameters {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let serde_json::Value::Object(overlay) = caller {
        for (k, v) in overlay {
            merged.insert(k.clone(), v.clone());
        }
    }
    if !context.is_empty() {
        merged.insert(
            "context".to_string(),
            serde_json::Value::Object(context.clone()),
        );
    }
    serde_json::Value::Object(merged)
}
