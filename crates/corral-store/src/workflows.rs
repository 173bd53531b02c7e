use chrono::Utc;
use tracing::instrument;

use corral_core::ids::{CorrelationId, SandboxId};
use corral_core::workflow::{WorkflowExecution, WorkflowStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persists workflow executions as checkpoints keyed by correlation id.
/// The engine saves after every step transition, so a crash mid-workflow
/// leaves the last known state queryable.
pub struct WorkflowRunRepo {
    db: Database,
}

impl WorkflowRunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the checkpoint for this execution.
    #[instrument(skip(self, execution), fields(correlation_id = %execution.correlation_id, status = %execution.status))]
    pub fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let body = serde_json::to_string(execution)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_runs (correlation_id, run_id, workflow_id, sandbox_id,
                        session_id, status, execution, total_duration_ms, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(correlation_id) DO UPDATE SET
                        status = excluded.status,
                        execution = excluded.execution,
                        total_duration_ms = excluded.total_duration_ms,
                        updated_at = excluded.updated_at",
                rusqlite::params![
                    execution.correlation_id.as_str(),
                    execution.run_id.as_str(),
                    execution.workflow_id,
                    execution.sandbox_id.as_str(),
                    execution.session_id.as_str(),
                    execution.status.to_string(),
                    body,
                    execution.total_duration_ms,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch the checkpoint for a correlation id.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub fn get(&self, correlation_id: &CorrelationId) -> Result<WorkflowExecution, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT execution FROM workflow_runs WHERE correlation_id = ?1",
            )?;
            let mut rows = stmt.query([correlation_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let body: String = row_helpers::get(row, 0, "workflow_runs", "execution")?;
                    serde_json::from_str(&body).map_err(|e| StoreError::CorruptRow {
                        table: "workflow_runs",
                        column: "execution",
                        detail: e.to_string(),
                    })
                }
                None => Err(StoreError::NotFound(format!(
                    "workflow run {correlation_id}"
                ))),
            }
        })
    }

    /// List executions for a sandbox, newest first, optionally by status.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id))]
    pub fn list_for_sandbox(
        &self,
        sandbox_id: &SandboxId,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (&str, Vec<Box<dyn rusqlite::ToSql>>) = match status {
                Some(s) => (
                    "SELECT execution FROM workflow_runs
                     WHERE sandbox_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3",
                    vec![
                        Box::new(sandbox_id.as_str().to_string()),
                        Box::new(s.to_string()),
                        Box::new(limit),
                    ],
                ),
                None => (
                    "SELECT execution FROM workflow_runs WHERE sandbox_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                    vec![Box::new(sandbox_id.as_str().to_string()), Box::new(limit)],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row_helpers::get(row, 0, "workflow_runs", "execution")?;
                out.push(serde_json::from_str(&body).map_err(|e| StoreError::CorruptRow {
                    table: "workflow_runs",
                    column: "execution",
                    detail: e.to_string(),
                })?);
            }
            Ok(out)
        })
    }
}
