use serde::{Deserialize, Serialize};
use tracing::instrument;

use corral_core::ids::{RequestId, SandboxId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// What kind of operation consumed tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ToolCall,
    WorkflowStep,
    RawMessage,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolCall => write!(f, "tool_call"),
            Self::WorkflowStep => write!(f, "workflow_step"),
            Self::RawMessage => write!(f, "raw_message"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "workflow_step" => Ok(Self::WorkflowStep),
            "raw_message" => Ok(Self::RawMessage),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogRow {
    pub id: String,
    pub sandbox_id: SandboxId,
    pub session_id: Option<SessionId>,
    pub operation_type: OperationType,
    pub tokens_used: u64,
    pub request_id: Option<RequestId>,
    pub created_at: String,
}

pub struct UsageLogRepo {
    db: Database,
}

impl UsageLogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// List usage rows for a sandbox, newest first.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, limit))]
    pub fn list_for_sandbox(
        &self,
        sandbox_id: &SandboxId,
        limit: u32,
    ) -> Result<Vec<UsageLogRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sandbox_id, session_id, operation_type, tokens_used, request_id, created_at
                 FROM token_usage_log WHERE sandbox_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![sandbox_id.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_usage(row)?);
            }
            Ok(out)
        })
    }

    /// Total rows logged for a sandbox.
    pub fn count_for_sandbox(&self, sandbox_id: &SandboxId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM token_usage_log WHERE sandbox_id = ?1",
                [sandbox_id.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> Result<UsageLogRow, StoreError> {
    let sandbox_id: String = row_helpers::get(row, 1, "token_usage_log", "sandbox_id")?;
    let session_id: Option<String> =
        row_helpers::get_opt(row, 2, "token_usage_log", "session_id")?;
    let op_raw: String = row_helpers::get(row, 3, "token_usage_log", "operation_type")?;
    let request_id: Option<String> =
        row_helpers::get_opt(row, 5, "token_usage_log", "request_id")?;
    Ok(UsageLogRow {
        id: row_helpers::get(row, 0, "token_usage_log", "id")?,
        sandbox_id: SandboxId::from_raw(sandbox_id),
        session_id: session_id.map(SessionId::from_raw),
        operation_type: row_helpers::parse_enum(&op_raw, "token_usage_log", "operation_type")?,
        tokens_used: row_helpers::get(row, 4, "token_usage_log", "tokens_used")?,
        request_id: request_id.map(RequestId::from_raw),
        created_at: row_helpers::get(row, 6, "token_usage_log", "created_at")?,
    })
}
