use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use corral_core::ids::{SandboxId, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub sandbox_id: SandboxId,
    pub user_id: UserId,
    pub channel: String,
    pub is_active: bool,
    pub last_activity_at: String,
    pub created_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session bound to an active sandbox. The channel name is
    /// derived from the sandbox id plus a fresh suffix, so it is unique
    /// across the lifetime of the store.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, user_id = %user_id))]
    pub fn create(
        &self,
        sandbox_id: &SandboxId,
        user_id: &UserId,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let channel = format!("{sandbox_id}:chan_{}", uuid::Uuid::now_v7().simple());
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let is_active: i64 = conn
                .query_row(
                    "SELECT is_active FROM sandboxes WHERE id = ?1",
                    [sandbox_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("sandbox {sandbox_id}"))
                    }
                    other => other.into(),
                })?;
            if is_active == 0 {
                return Err(StoreError::Conflict(format!(
                    "sandbox {sandbox_id} is not active"
                )));
            }

            conn.execute(
                "INSERT INTO sandbox_sessions (id, sandbox_id, user_id, channel, is_active, last_activity_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                rusqlite::params![
                    id.as_str(),
                    sandbox_id.as_str(),
                    user_id.as_str(),
                    channel,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                sandbox_id: sandbox_id.clone(),
                user_id: user_id.clone(),
                channel,
                is_active: true,
                last_activity_at: now.clone(),
                created_at: now,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sandbox_id, user_id, channel, is_active, last_activity_at, created_at
                 FROM sandbox_sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions for a sandbox, newest first. Active only when
    /// `active_only` is set.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id))]
    pub fn list_for_sandbox(
        &self,
        sandbox_id: &SandboxId,
        active_only: bool,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = if active_only {
                "SELECT id, sandbox_id, user_id, channel, is_active, last_activity_at, created_at
                 FROM sandbox_sessions WHERE sandbox_id = ?1 AND is_active = 1
                 ORDER BY created_at DESC"
            } else {
                "SELECT id, sandbox_id, user_id, channel, is_active, last_activity_at, created_at
                 FROM sandbox_sessions WHERE sandbox_id = ?1
                 ORDER BY created_at DESC"
            };
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([sandbox_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    /// Mark a session inactive. Ending twice is a no-op.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn end(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sandbox_sessions SET is_active = 0 WHERE id = ?1",
                [id.as_str()],
            )?;
            if changed == 0 {
                // Distinguish "already ended" from "never existed"
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sandbox_sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(StoreError::NotFound(format!("session {id}")));
                }
            }
            Ok(())
        })
    }

    /// Refresh the activity timestamp on a session.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sandbox_sessions SET last_activity_at = ?1 WHERE id = ?2 AND is_active = 1",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("active session {id}")));
            }
            Ok(())
        })
    }

    /// End every active session whose last activity is older than the cutoff.
    /// Returns how many were ended.
    #[instrument(skip(self))]
    pub fn end_idle(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = older_than.to_rfc3339();
        self.db.with_conn(|conn| {
            let ended = conn.execute(
                "UPDATE sandbox_sessions SET is_active = 0
                 WHERE is_active = 1 AND datetime(last_activity_at) < datetime(?1)",
                [cutoff],
            )?;
            if ended > 0 {
                debug!(ended, "idle sessions ended");
            }
            Ok(ended)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let id: String = row_helpers::get(row, 0, "sandbox_sessions", "id")?;
    let sandbox_id: String = row_helpers::get(row, 1, "sandbox_sessions", "sandbox_id")?;
    let user_id: String = row_helpers::get(row, 2, "sandbox_sessions", "user_id")?;
    let is_active: i64 = row_helpers::get(row, 4, "sandbox_sessions", "is_active")?;
    Ok(SessionRow {
        id: SessionId::from_raw(id),
        sandbox_id: SandboxId::from_raw(sandbox_id),
        user_id: UserId::from_raw(user_id),
        channel: row_helpers::get(row, 3, "sandbox_sessions", "channel")?,
        is_active: is_active != 0,
        last_activity_at: row_helpers::get(row, 5, "sandbox_sessions", "last_activity_at")?,
        created_at: row_helpers::get(row, 6, "sandbox_sessions", "created_at")?,
    })
}
