use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::error;

use corral_core::ids::{CorrelationId, SandboxId, SessionId, UserId};
use corral_engine::invoker::InvokeRequest;
use corral_engine::workflow::WorkflowRequest;
use corral_engine::{EngineError, ToolInvoker, WorkflowEngine};
use corral_store::replay::ReplayRepo;
use corral_store::sandboxes::SandboxRepo;
use corral_store::sessions::SessionRepo;
use corral_store::usage_log::UsageLogRepo;
use corral_store::workflows::WorkflowRunRepo;
use corral_store::StoreError;
use corral_telemetry::MetricsRecorder;

use crate::client;
use crate::delivery::DeliveryLayer;

pub struct AppState {
    pub sandboxes: Arc<SandboxRepo>,
    pub sessions: Arc<SessionRepo>,
    pub usage_log: Arc<UsageLogRepo>,
    pub replay: Arc<ReplayRepo>,
    pub runs: Arc<WorkflowRunRepo>,
    pub invoker: Arc<ToolInvoker>,
    pub workflow_engine: Arc<WorkflowEngine>,
    pub delivery: Arc<DeliveryLayer>,
    pub metrics: Arc<MetricsRecorder>,
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.error_code();
        let (status, body) = match &self.0 {
            EngineError::RateLimitExceeded { sandbox_id, state } => (
                StatusCode::LOCKED,
                serde_json::json!({
                    "code": code,
                    "sandbox_id": sandbox_id,
                    "state": state,
                }),
            ),
            EngineError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"code": code, "message": msg}),
            ),
            EngineError::SessionNotFound(msg) | EngineError::UnknownWorkflow(msg) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"code": code, "message": msg}),
            ),
            EngineError::Store(StoreError::NotFound(msg)) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"code": "NOT_FOUND", "message": msg}),
            ),
            EngineError::Store(StoreError::Conflict(msg)) => (
                StatusCode::CONFLICT,
                serde_json::json!({"code": "CONFLICT", "message": msg}),
            ),
            EngineError::SandboxInactive(sandbox_id) => (
                StatusCode::CONFLICT,
                serde_json::json!({"code": code, "sandbox_id": sandbox_id}),
            ),
            EngineError::Adapter(e) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({"code": code, "message": e.to_string(), "kind": e.error_kind()}),
            ),
            EngineError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({"code": code, "message": self.0.to_string()}),
            ),
            other => {
                error!(error = %other, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"code": code, "message": "internal error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
pub struct CreateSandboxRequest {
    pub user_id: UserId,
    pub name: String,
    pub hourly_token_limit: u64,
    pub daily_token_limit: u64,
}

pub async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sandbox = state.sandboxes.create(
        &req.user_id,
        &req.name,
        req.hourly_token_limit,
        req.daily_token_limit,
    )?;
    Ok((StatusCode::CREATED, Json(sandbox)))
}

pub async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sandbox = state.sandboxes.get(&SandboxId::from_raw(id))?;
    Ok(Json(sandbox))
}

pub async fn deactivate_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sandboxes.deactivate(&SandboxId::from_raw(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.sandboxes.usage(&SandboxId::from_raw(id))?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
pub struct UsageLogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: u32,
}

fn default_log_limit() -> u32 {
    50
}

pub async fn list_usage_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UsageLogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .usage_log
        .list_for_sandbox(&SandboxId::from_raw(id), query.limit)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: UserId,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create(&SandboxId::from_raw(id), &req.user_id)?;
    state.delivery.register_session(&session.id, &session.sandbox_id);
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get(&SessionId::from_raw(id))?;
    Ok(Json(session))
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = SessionId::from_raw(id);
    state.sessions.end(&id)?;
    state.delivery.remove_session(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .sessions
        .list_for_sandbox(&SandboxId::from_raw(id), query.active_only)?;
    Ok(Json(sessions))
}

pub async fn execute_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_session_in_sandbox(&state, &req.session_id, &SandboxId::from_raw(id))?;
    let outcome = state.invoker.execute(req).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct ExecuteWorkflowRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path((id, workflow_id)): Path<(String, String)>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_session_in_sandbox(&state, &req.session_id, &SandboxId::from_raw(id))?;
    let execution = state
        .workflow_engine
        .execute_workflow(WorkflowRequest {
            session_id: req.session_id,
            workflow_id,
            parameters: req.parameters,
            correlation_id: req.correlation_id,
        })
        .await?;
    Ok(Json(execution))
}

fn require_session_in_sandbox(
    state: &AppState,
    session_id: &SessionId,
    sandbox_id: &SandboxId,
) -> Result<(), ApiError> {
    let session = state.sessions.get(session_id)?;
    if &session.sandbox_id != sandbox_id {
        return Err(EngineError::Validation(format!(
            "session {session_id} does not belong to sandbox {sandbox_id}"
        ))
        .into());
    }
    Ok(())
}

pub async fn get_replay(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .replay
        .list(&CorrelationId::from_raw(correlation_id))?;
    Ok(Json(entries))
}

pub async fn get_workflow_run(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution = state.runs.get(&CorrelationId::from_raw(correlation_id))?;
    Ok(Json(execution))
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub session_id: SessionId,
}

pub async fn ws_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = state.sessions.get(&query.session_id)?;
    if !session.is_active {
        return Err(EngineError::Validation(format!(
            "session {} has ended",
            query.session_id
        ))
        .into());
    }
    // Reconnects after a server restart re-register lazily here.
    state
        .delivery
        .register_session(&session.id, &session.sandbox_id);

    let delivery = Arc::clone(&state.delivery);
    Ok(upgrade.on_upgrade(move |socket| client::run_client(socket, session.id, delivery)))
}
