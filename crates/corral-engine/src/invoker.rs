use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use corral_core::adapter::{CallContext, ToolOutput};
use corral_core::errors::AdapterError;
use corral_core::estimate::estimate_param_tokens;
use corral_core::events::{ExecutionEvent, ReplayKind};
use corral_core::ids::{CorrelationId, RequestId, SessionId};
use corral_store::replay::ReplayRepo;
use corral_store::sandboxes::UsageSnapshot;
use corral_store::sessions::{SessionRepo, SessionRow};
use corral_store::usage_log::OperationType;
use corral_telemetry::MetricsRecorder;

use crate::bus::EventBus;
use crate::error::EngineError;
use crate::ledger::BudgetLedger;
use crate::registry::AdapterRegistry;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize)]
pub struct InvokeRequest {
    pub session_id: SessionId,
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub dry_run: bool,
    /// Caller-supplied cost estimate for admission. When absent the
    /// invoker derives one from the serialized parameters.
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    /// Supplied by the workflow engine so all steps of one run share a
    /// correlation. Standalone calls get a fresh one.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InvokeOutcome {
    pub correlation_id: CorrelationId,
    pub request_id: RequestId,
    pub result: serde_json::Value,
    pub tokens_used: u64,
    pub duration_ms: u64,
    /// False for dry runs: the result is advisory and nothing was charged.
    pub is_final: bool,
    pub usage: UsageSnapshot,
}

/// Executes a single tool call end to end: validate, resolve the session,
/// estimate cost, gate on the budget, invoke the adapter, settle actual
/// usage, and record every transition on the bus and in the replay log.
pub struct ToolInvoker {
    registry: Arc<AdapterRegistry>,
    ledger: Arc<BudgetLedger>,
    sessions: Arc<SessionRepo>,
    replay: Arc<ReplayRepo>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRecorder>,
    call_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        ledger: Arc<BudgetLedger>,
        sessions: Arc<SessionRepo>,
        replay: Arc<ReplayRepo>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            registry,
            ledger,
            sessions,
            replay,
            bus,
            metrics,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn execute(&self, request: InvokeRequest) -> Result<InvokeOutcome, EngineError> {
        self.execute_as(request, OperationType::ToolCall).await
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, tool = %request.tool))]
    pub(crate) async fn execute_as(
        &self,
        request: InvokeRequest,
        operation_type: OperationType,
    ) -> Result<InvokeOutcome, EngineError> {
        if !request.parameters.is_object() && !request.parameters.is_null() {
            return Err(EngineError::Validation(
                "parameters must be a JSON object".into(),
            ));
        }
        let adapter = self
            .registry
            .get(&request.tool)
            .ok_or_else(|| EngineError::Validation(format!("unknown tool: {}", request.tool)))?;

        let session = self.resolve_session(&request.session_id)?;
        self.sessions.touch(&session.id)?;

        let correlation_id = request.correlation_id.unwrap_or_default();
        let request_id = RequestId::new();
        let estimated_tokens = request
            .estimated_tokens
            .unwrap_or_else(|| estimate_param_tokens(&request.parameters));

        if let Err(err) = self
            .ledger
            .check_rate_limit(&session.sandbox_id, estimated_tokens)
        {
            if let EngineError::RateLimitExceeded { ref state, .. } = err {
                self.record_denial(&correlation_id, &session, &request.tool, estimated_tokens, state)?;
            }
            return Err(err);
        }

        self.replay.append(
            &correlation_id,
            ReplayKind::AdmissionGranted,
            serde_json::json!({
                "tool": request.tool,
                "estimated_tokens": estimated_tokens,
                "dry_run": request.dry_run,
            }),
        )?;
        self.bus.publish(&ExecutionEvent::ToolStart {
            correlation_id: correlation_id.clone(),
            sandbox_id: session.sandbox_id.clone(),
            session_id: session.id.clone(),
            tool_name: request.tool.clone(),
            estimated_tokens,
        });
        self.replay.append(
            &correlation_id,
            ReplayKind::ToolStart,
            serde_json::json!({"tool": request.tool, "parameters": request.parameters}),
        )?;

        let ctx = CallContext {
            sandbox_id: session.sandbox_id.clone(),
            session_id: session.id.clone(),
            correlation_id: correlation_id.clone(),
            request_id: request_id.clone(),
            dry_run: request.dry_run,
        };

        let started = Instant::now();
        let invoked = self
            .invoke_with_retry(adapter.as_ref(), &request.parameters, &ctx)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match invoked {
            Ok(output) => {
                let settled = if request.dry_run {
                    self.ledger.usage(&session.sandbox_id)
                } else {
                    self.ledger.charge(
                        &session.sandbox_id,
                        Some(&session.id),
                        operation_type,
                        output.tokens_used,
                        Some(&request_id),
                    )
                };
                let usage = match settled {
                    Ok(usage) => usage,
                    Err(err) => {
                        // The adapter ran but settlement refused: deactivated
                        // mid-call, or a concurrent caller took the remaining
                        // budget. Recorded like any other tool failure.
                        self.bus.publish(&ExecutionEvent::ToolError {
                            correlation_id: correlation_id.clone(),
                            sandbox_id: session.sandbox_id.clone(),
                            session_id: session.id.clone(),
                            tool_name: request.tool.clone(),
                            error: err.to_string(),
                        });
                        self.replay.append(
                            &correlation_id,
                            ReplayKind::ToolError,
                            serde_json::json!({
                                "tool": request.tool,
                                "error": err.to_string(),
                                "kind": err.error_code(),
                            }),
                        )?;
                        self.metrics.increment_counter("tool_errors", 1);
                        return Err(err);
                    }
                };

                self.bus.publish(&ExecutionEvent::ToolComplete {
                    correlation_id: correlation_id.clone(),
                    sandbox_id: session.sandbox_id.clone(),
                    session_id: session.id.clone(),
                    tool_name: request.tool.clone(),
                    tokens_used: output.tokens_used,
                    duration_ms,
                });
                self.replay.append(
                    &correlation_id,
                    ReplayKind::ToolComplete,
                    serde_json::json!({
                        "tool": request.tool,
                        "tokens_used": output.tokens_used,
                        "duration_ms": duration_ms,
                        "is_final": !request.dry_run,
                    }),
                )?;
                self.metrics.increment_counter("tools_executed", 1);
                self.metrics
                    .observe("tool_duration_ms", duration_ms as f64);

                Ok(InvokeOutcome {
                    correlation_id,
                    request_id,
                    result: output.result,
                    tokens_used: output.tokens_used,
                    duration_ms,
                    is_final: !request.dry_run,
                    usage,
                })
            }
            Err(err) => {
                self.bus.publish(&ExecutionEvent::ToolError {
                    correlation_id: correlation_id.clone(),
                    sandbox_id: session.sandbox_id.clone(),
                    session_id: session.id.clone(),
                    tool_name: request.tool.clone(),
                    error: err.to_string(),
                });
                self.replay.append(
                    &correlation_id,
                    ReplayKind::ToolError,
                    serde_json::json!({"tool": request.tool, "error": err.to_string(), "kind": err.error_kind()}),
                )?;
                self.metrics.increment_counter("tool_errors", 1);

                match err {
                    AdapterError::Timeout(d) => Err(EngineError::Timeout(d)),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// One attempt, plus a single retry for retryable failures of adapters
    /// that declare themselves idempotent.
    async fn invoke_with_retry(
        &self,
        adapter: &dyn corral_core::adapter::ToolAdapter,
        parameters: &serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, AdapterError> {
        let first = self.invoke_once(adapter, parameters, ctx).await;
        match first {
            Err(ref err) if err.is_retryable() && adapter.is_idempotent() => {
                warn!(tool = adapter.name(), error = %err, "retrying after retryable failure");
                self.metrics.increment_counter("tool_retries", 1);
                self.invoke_once(adapter, parameters, ctx).await
            }
            other => other,
        }
    }

    async fn invoke_once(
        &self,
        adapter: &dyn corral_core::adapter::ToolAdapter,
        parameters: &serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, AdapterError> {
        match tokio::time::timeout(self.call_timeout, adapter.invoke(parameters.clone(), ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(self.call_timeout)),
        }
    }

    fn resolve_session(&self, session_id: &SessionId) -> Result<SessionRow, EngineError> {
        let session = self.sessions.get(session_id)?;
        if !session.is_active {
            return Err(EngineError::Validation(format!(
                "session {session_id} has ended"
            )));
        }
        Ok(session)
    }

    fn record_denial(
        &self,
        correlation_id: &CorrelationId,
        session: &SessionRow,
        tool: &str,
        estimated_tokens: u64,
        state: &UsageSnapshot,
    ) -> Result<(), EngineError> {
        debug!(
            sandbox_id = %session.sandbox_id,
            tool,
            estimated_tokens,
            "admission denied"
        );
        self.metrics.increment_counter("rate_limit_denials", 1);
        self.bus.publish(&ExecutionEvent::RateLimitExceeded {
            correlation_id: correlation_id.clone(),
            sandbox_id: session.sandbox_id.clone(),
            session_id: session.id.clone(),
            hourly_usage: state.hourly_usage,
            hourly_limit: state.hourly_limit,
            daily_usage: state.daily_usage,
            daily_limit: state.daily_limit,
        });
        self.replay.append(
            correlation_id,
            ReplayKind::AdmissionDenied,
            serde_json::json!({
                "tool": tool,
                "estimated_tokens": estimated_tokens,
                "hourly_usage": state.hourly_usage,
                "hourly_limit": state.hourly_limit,
                "daily_usage": state.daily_usage,
                "daily_limit": state.daily_limit,
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corral_core::adapter::ToolAdapter;
    use corral_core::ids::UserId;
    use corral_store::sandboxes::SandboxRepo;
    use corral_store::Database;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoAdapter {
        tokens: u64,
    }

    #[async_trait]
    impl ToolAdapter for EchoAdapter {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            parameters: serde_json::Value,
            _ctx: &CallContext,
        ) -> Result<ToolOutput, AdapterError> {
            Ok(ToolOutput {
                result: parameters,
                tokens_used: self.tokens,
            })
        }
    }

    struct FlakyAdapter {
        attempts: AtomicU32,
        idempotent: bool,
    }

    #[async_trait]
    impl ToolAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        fn is_idempotent(&self) -> bool {
            self.idempotent
        }

        async fn invoke(
            &self,
            _parameters: serde_json::Value,
            _ctx: &CallContext,
        ) -> Result<ToolOutput, AdapterError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AdapterError::NetworkError("connection reset".into()))
            } else {
                Ok(ToolOutput {
                    result: serde_json::json!({"ok": true}),
                    tokens_used: 5,
                })
            }
        }
    }

    struct SlowAdapter;

    #[async_trait]
    impl ToolAdapter for SlowAdapter {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _parameters: serde_json::Value,
            _ctx: &CallContext,
        ) -> Result<ToolOutput, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!()
        }
    }

    struct Harness {
        invoker: ToolInvoker,
        ledger: Arc<BudgetLedger>,
        replay: Arc<ReplayRepo>,
        sandboxes: Arc<SandboxRepo>,
        session_id: SessionId,
        sandbox_id: corral_core::ids::SandboxId,
    }

    fn harness_with(adapters: Vec<Arc<dyn ToolAdapter>>, hourly: u64, daily: u64) -> Harness {
        let db = Database::in_memory().unwrap();
        let sandboxes = Arc::new(SandboxRepo::new(db.clone()));
        let sessions = Arc::new(SessionRepo::new(db.clone()));
        let replay = Arc::new(ReplayRepo::new(db));
        let ledger = Arc::new(BudgetLedger::new(Arc::clone(&sandboxes)));

        let user = UserId::new();
        let sbx = sandboxes.create(&user, "test", hourly, daily).unwrap();
        let session = sessions.create(&sbx.id, &user).unwrap();

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }

        let invoker = ToolInvoker::new(
            Arc::new(registry),
            Arc::clone(&ledger),
            sessions,
            Arc::clone(&replay),
            Arc::new(EventBus::new()),
            Arc::new(MetricsRecorder::new()),
        );

        Harness {
            invoker,
            ledger,
            replay,
            sandboxes,
            session_id: session.id,
            sandbox_id: sbx.id,
        }
    }

    fn request(h: &Harness, tool: &str) -> InvokeRequest {
        InvokeRequest {
            session_id: h.session_id.clone(),
            tool: tool.into(),
            parameters: serde_json::json!({"q": "weekly report"}),
            dry_run: false,
            estimated_tokens: None,
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn successful_call_charges_actual_tokens() {
        let h = harness_with(vec![Arc::new(EchoAdapter { tokens: 42 })], 1000, 10000);
        let outcome = h.invoker.execute(request(&h, "echo")).await.unwrap();

        assert_eq!(outcome.tokens_used, 42);
        assert!(outcome.is_final);
        assert_eq!(outcome.usage.hourly_usage, 42);
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 42);

        let entries = h.replay.list(&outcome.correlation_id).unwrap();
        let kinds: Vec<ReplayKind> = entries.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                ReplayKind::AdmissionGranted,
                ReplayKind::ToolStart,
                ReplayKind::ToolComplete
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_any_charge() {
        let h = harness_with(vec![], 1000, 10000);
        let err = h.invoker.execute(request(&h, "missing")).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 0);
    }

    #[tokio::test]
    async fn denial_leaves_budget_untouched_and_logs_it() {
        // Estimate for this payload is well above a 10-token hourly budget
        let h = harness_with(vec![Arc::new(EchoAdapter { tokens: 1 })], 10, 100);
        let err = h.invoker.execute(request(&h, "echo")).await.unwrap_err();

        match err {
            EngineError::RateLimitExceeded { state, .. } => {
                assert_eq!(state.hourly_usage, 0);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 0);
    }

    #[tokio::test]
    async fn inactive_sandbox_is_denied_before_the_adapter_runs() {
        let adapter = Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            idempotent: false,
        });
        let h = harness_with(vec![adapter.clone() as Arc<dyn ToolAdapter>], 1000, 10000);
        h.sandboxes.deactivate(&h.sandbox_id).unwrap();

        let err = h.invoker.execute(request(&h, "flaky")).await.unwrap_err();
        assert_eq!(err.error_code(), "SANDBOX_INACTIVE");
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn charge_refusal_after_adapter_success_reaches_the_replay_log() {
        // Echo reports more tokens than the whole hourly budget, so the
        // advisory check passes and settlement refuses.
        let h = harness_with(vec![Arc::new(EchoAdapter { tokens: 2000 })], 1000, 10000);
        let mut req = request(&h, "echo");
        let corr = CorrelationId::new();
        req.correlation_id = Some(corr.clone());

        let err = h.invoker.execute(req).await.unwrap_err();
        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 0);

        let kinds: Vec<ReplayKind> = h
            .replay
            .list(&corr)
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ReplayKind::AdmissionGranted,
                ReplayKind::ToolStart,
                ReplayKind::ToolError
            ]
        );
    }

    #[tokio::test]
    async fn dry_run_returns_non_final_result_with_budget_unchanged() {
        let h = harness_with(vec![Arc::new(EchoAdapter { tokens: 42 })], 1000, 10000);
        let mut req = request(&h, "echo");
        req.dry_run = true;

        let outcome = h.invoker.execute(req).await.unwrap();
        assert!(!outcome.is_final);
        assert_eq!(outcome.usage.hourly_usage, 0);
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 0);
    }

    #[tokio::test]
    async fn retryable_failure_retried_once_for_idempotent_adapter() {
        let adapter = Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            idempotent: true,
        });
        let h = harness_with(vec![adapter.clone() as Arc<dyn ToolAdapter>], 1000, 10000);

        let outcome = h.invoker.execute(request(&h, "flaky")).await.unwrap();
        assert_eq!(outcome.tokens_used, 5);
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_idempotent_adapter_is_never_retried() {
        let adapter = Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            idempotent: false,
        });
        let h = harness_with(vec![adapter.clone() as Arc<dyn ToolAdapter>], 1000, 10000);

        let err = h.invoker.execute(request(&h, "flaky")).await.unwrap_err();
        assert_eq!(err.error_code(), "ADAPTER_ERROR");
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);

        // The failed attempt consumed nothing
        assert_eq!(h.ledger.usage(&h.sandbox_id).unwrap().hourly_usage, 0);
    }

    #[tokio::test]
    async fn slow_adapter_times_out() {
        let h = harness_with(vec![Arc::new(SlowAdapter)], 1000, 10000);
        let invoker = h.invoker.with_call_timeout(Duration::from_millis(50));

        let req = InvokeRequest {
            session_id: h.session_id.clone(),
            tool: "slow".into(),
            parameters: serde_json::json!({}),
            dry_run: false,
            estimated_tokens: None,
            correlation_id: None,
        };
        let err = invoker.execute(req).await.unwrap_err();
        assert_eq!(err.error_code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn error_path_recorded_in_replay() {
        let adapter = Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            idempotent: false,
        });
        let h = harness_with(vec![adapter as Arc<dyn ToolAdapter>], 1000, 10000);

        let mut req = request(&h, "flaky");
        let corr = CorrelationId::new();
        req.correlation_id = Some(corr.clone());
        let _ = h.invoker.execute(req).await;

        let kinds: Vec<ReplayKind> = h
            .replay
            .list(&corr)
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ReplayKind::AdmissionGranted,
                ReplayKind::ToolStart,
                ReplayKind::ToolError
            ]
        );
    }
}
