use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use corral_core::ids::{RequestId, SandboxId, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::usage_log::OperationType;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxRow {
    pub id: SandboxId,
    pub user_id: UserId,
    pub name: String,
    pub hourly_token_limit: u64,
    pub daily_token_limit: u64,
    pub current_hourly_usage: u64,
    pub current_daily_usage: u64,
    pub hourly_reset_at: String,
    pub daily_reset_at: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Point-in-time budget state, returned with every admission decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub hourly_usage: u64,
    pub hourly_limit: u64,
    pub daily_usage: u64,
    pub daily_limit: u64,
}

impl UsageSnapshot {
    pub fn would_exceed(&self, tokens: u64) -> bool {
        self.hourly_usage + tokens > self.hourly_limit
            || self.daily_usage + tokens > self.daily_limit
    }
}

pub struct SandboxRepo {
    db: Database,
}

impl SandboxRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new sandbox with fresh budget windows anchored at now.
    #[instrument(skip(self), fields(user_id = %user_id, name))]
    pub fn create(
        &self,
        user_id: &UserId,
        name: &str,
        hourly_token_limit: u64,
        daily_token_limit: u64,
    ) -> Result<SandboxRow, StoreError> {
        if hourly_token_limit == 0 || daily_token_limit == 0 {
            return Err(StoreError::Conflict(
                "token limits must be positive".into(),
            ));
        }
        if daily_token_limit < hourly_token_limit {
            return Err(StoreError::Conflict(
                "daily limit must be at least the hourly limit".into(),
            ));
        }

        let id = SandboxId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sandboxes (id, user_id, name, hourly_token_limit, daily_token_limit,
                        current_hourly_usage, current_daily_usage, hourly_reset_at, daily_reset_at,
                        is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6, 1, ?6, ?6)",
                rusqlite::params![
                    id.as_str(),
                    user_id.as_str(),
                    name,
                    hourly_token_limit,
                    daily_token_limit,
                    now,
                ],
            )?;

            Ok(SandboxRow {
                id,
                user_id: user_id.clone(),
                name: name.to_string(),
                hourly_token_limit,
                daily_token_limit,
                current_hourly_usage: 0,
                current_daily_usage: 0,
                hourly_reset_at: now.clone(),
                daily_reset_at: now.clone(),
                is_active: true,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a sandbox by ID.
    #[instrument(skip(self), fields(sandbox_id = %id))]
    pub fn get(&self, id: &SandboxId) -> Result<SandboxRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, hourly_token_limit, daily_token_limit,
                        current_hourly_usage, current_daily_usage, hourly_reset_at, daily_reset_at,
                        is_active, created_at, updated_at
                 FROM sandboxes WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_sandbox(row),
                None => Err(StoreError::NotFound(format!("sandbox {id}"))),
            }
        })
    }

    /// List sandboxes for a user, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SandboxRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, hourly_token_limit, daily_token_limit,
                        current_hourly_usage, current_daily_usage, hourly_reset_at, daily_reset_at,
                        is_active, created_at, updated_at
                 FROM sandboxes WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_sandbox(row)?);
            }
            Ok(out)
        })
    }

    /// Deactivate a sandbox. Subsequent admissions are refused.
    #[instrument(skip(self), fields(sandbox_id = %id))]
    pub fn deactivate(&self, id: &SandboxId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sandboxes SET is_active = 0, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("sandbox {id}")));
            }
            Ok(())
        })
    }

    /// Read the current budget state without modifying it.
    #[instrument(skip(self), fields(sandbox_id = %id))]
    pub fn usage(&self, id: &SandboxId) -> Result<UsageSnapshot, StoreError> {
        let row = self.get(id)?;
        Ok(UsageSnapshot {
            hourly_usage: row.current_hourly_usage,
            hourly_limit: row.hourly_token_limit,
            daily_usage: row.current_daily_usage,
            daily_limit: row.daily_token_limit,
        })
    }

    /// Atomically charge `tokens` against both budget windows and append a
    /// usage log row. The increment and the limit check happen in a single
    /// conditional UPDATE, so concurrent callers can never jointly overshoot
    /// a limit. Returns the post-charge snapshot, or LimitExceeded with the
    /// unchanged state when either window would overflow.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, tokens))]
    pub fn try_track_usage(
        &self,
        sandbox_id: &SandboxId,
        session_id: Option<&SessionId>,
        operation_type: OperationType,
        tokens: u64,
        request_id: Option<&RequestId>,
    ) -> Result<UsageSnapshot, StoreError> {
        let now = Utc::now().to_rfc3339();
        let log_id = uuid::Uuid::now_v7().to_string();

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let changed = tx.execute(
                "UPDATE sandboxes SET
                        current_hourly_usage = current_hourly_usage + ?1,
                        current_daily_usage = current_daily_usage + ?1,
                        updated_at = ?2
                 WHERE id = ?3 AND is_active = 1
                   AND current_hourly_usage + ?1 <= hourly_token_limit
                   AND current_daily_usage + ?1 <= daily_token_limit",
                rusqlite::params![tokens, now, sandbox_id.as_str()],
            )?;

            let snapshot = read_snapshot(&tx, sandbox_id)?;

            if changed == 0 {
                tx.rollback()?;
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
                debug!(
                    sandbox_id = %sandbox_id,
                    tokens,
                    hourly_usage = snapshot.hourly_usage,
                    daily_usage = snapshot.daily_usage,
                    "charge refused"
                );
                return Err(StoreError::LimitExceeded {
                    sandbox_id: sandbox_id.to_string(),
                    hourly_usage: snapshot.hourly_usage,
                    hourly_limit: snapshot.hourly_limit,
                    daily_usage: snapshot.daily_usage,
                    daily_limit: snapshot.daily_limit,
                });
            }

            tx.execute(
                "INSERT INTO token_usage_log (id, sandbox_id, session_id, operation_type,
                        tokens_used, request_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    log_id,
                    sandbox_id.as_str(),
                    session_id.map(|s| s.as_str()),
                    operation_type.to_string(),
                    tokens,
                    request_id.map(|r| r.as_str()),
                    now,
                ],
            )?;

            tx.commit()?;
            Ok(snapshot)
        })
    }

    /// Reset every budget window whose period has fully elapsed. Keyed off
    /// the stored reset timestamps, so calling this twice in a row is a
    /// no-op the second time. Returns (hourly_resets, daily_resets).
    #[instrument(skip(self))]
    pub fn reset_elapsed_windows(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), StoreError> {
        let now_s = now.to_rfc3339();
        let hour_ago = (now - Duration::hours(1)).to_rfc3339();
        let day_ago = (now - Duration::hours(24)).to_rfc3339();

        self.db.with_conn(|conn| {
            let hourly = conn.execute(
                "UPDATE sandboxes SET current_hourly_usage = 0, hourly_reset_at = ?1, updated_at = ?1
                 WHERE datetime(hourly_reset_at) <= datetime(?2)",
                rusqlite::params![now_s, hour_ago],
            )?;
            let daily = conn.execute(
                "UPDATE sandboxes SET current_daily_usage = 0, daily_reset_at = ?1, updated_at = ?1
                 WHERE datetime(daily_reset_at) <= datetime(?2)",
                rusqlite::params![now_s, day_ago],
            )?;
            if hourly > 0 || daily > 0 {
                debug!(hourly, daily, "budget windows reset");
            }
            Ok((hourly, daily))
        })
    }

}

fn read_snapshot(
    conn: &rusqlite::Connection,
    id: &SandboxId,
) -> Result<UsageSnapshot, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT current_hourly_usage, hourly_token_limit, current_daily_usage, daily_token_limit
         FROM sandboxes WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(UsageSnapshot {
            hourly_usage: row_helpers::get(row, 0, "sandboxes", "current_hourly_usage")?,
            hourly_limit: row_helpers::get(row, 1, "sandboxes", "hourly_token_limit")?,
            daily_usage: row_helpers::get(row, 2, "sandboxes", "current_daily_usage")?,
            daily_limit: row_helpers::get(row, 3, "sandboxes", "daily_token_limit")?,
        }),
        None => Err(StoreError::NotFound(format!("sandbox {id}"))),
    }
}

fn row_to_sandbox(row: &rusqlite::Row<'_>) -> Result<SandboxRow, StoreError> {
    let id: String = row_helpers::get(row, 0, "sandboxes", "id")?;
    let user_id: String = row_helpers::get(row, 1, "sandboxes", "user_id")?;
    let is_active: i64 = row_helpers::get(row, 9, "sandboxes", "is_active")?;
    Ok(SandboxRow {
        id: SandboxId::from_raw(id),
        user_id: UserId::from_raw(user_id),
        name: row_helpers::get(row, 2, "sandboxes", "name")?,
        hourly_token_limit: row_helpers::get(row, 3, "sandboxes", "hourly_token_limit")?,
        daily_token_limit: row_helpers::get(row, 4, "sandboxes", "daily_token_limit")?,
        current_hourly_usage: row_helpers::get(row, 5, "sandboxes", "current_hourly_usage")?,
        current_daily_usage: row_helpers::get(row, 6, "sandboxes", "current_daily_usage")?,
        hourly_reset_at: row_helpers::get(row, 7, "sandboxes", "hourly_reset_at")?,
        daily_reset_at: row_helpers::get(row, 8, "sandboxes", "daily_reset_at")?,
        is_active: is_active != 0,
        created_at: row_helpers::get(row, 10, "sandboxes", "created_at")?,
        updated_at: row_helpers::get(row, 11, "sandboxes", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SandboxRepo {
        SandboxRepo::new(Database::in_memory().unwrap())
    }

    fn make_sandbox(repo: &SandboxRepo, hourly: u64, daily: u64) -> SandboxRow {
        repo.create(&UserId::new(), "test", hourly, daily).unwrap()
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        let fetched = repo.get(&sbx.id).unwrap();
        assert_eq!(fetched.name, "test");
        assert_eq!(fetched.hourly_token_limit, 1000);
        assert_eq!(fetched.current_hourly_usage, 0);
        assert!(fetched.is_active);
    }

    #[test]
    fn create_rejects_bad_limits() {
        let repo = repo();
        assert!(repo.create(&UserId::new(), "z", 0, 100).is_err());
        assert!(repo.create(&UserId::new(), "z", 1000, 100).is_err());
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = repo();
        let err = repo.get(&SandboxId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn track_usage_charges_both_windows() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        let snap = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 300, None)
            .unwrap();
        assert_eq!(snap.hourly_usage, 300);
        assert_eq!(snap.daily_usage, 300);
    }

    #[test]
    fn charge_to_exact_limit_succeeds_then_one_more_fails() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);

        let snap = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 999, None)
            .unwrap();
        assert_eq!(snap.hourly_usage, 999);

        // 999 + 2 > 1000: refused, usage unchanged
        let err = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 2, None)
            .unwrap_err();
        match err {
            StoreError::LimitExceeded {
                hourly_usage,
                hourly_limit,
                ..
            } => {
                assert_eq!(hourly_usage, 999);
                assert_eq!(hourly_limit, 1000);
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
        assert_eq!(repo.usage(&sbx.id).unwrap().hourly_usage, 999);

        // 999 + 1 == 1000: exactly at the limit, admitted
        let snap = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 1, None)
            .unwrap();
        assert_eq!(snap.hourly_usage, 1000);
    }

    #[test]
    fn daily_limit_enforced_independently() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 500, 800);

        repo.try_track_usage(&sbx.id, None, OperationType::ToolCall, 500, None)
            .unwrap();
        // hourly window still has room after a reset, but daily does not
        repo.reset_elapsed_windows(Utc::now() + Duration::hours(2))
            .unwrap();
        let err = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 400, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::LimitExceeded { .. }));
    }

    #[test]
    fn inactive_sandbox_refuses_charges() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        repo.deactivate(&sbx.id).unwrap();
        let err = repo
            .try_track_usage(&sbx.id, None, OperationType::ToolCall, 10, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn refused_charge_leaves_no_usage_log_row() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 100, 1000);
        let _ = repo.try_track_usage(&sbx.id, None, OperationType::ToolCall, 200, None);
        let count: i64 = repo
            .db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM token_usage_log", [], |r| r.get(0))
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn concurrent_charges_never_overshoot() {
        use std::sync::Arc;

        let db = Database::open(
            &std::env::temp_dir()
                .join(format!("corral-ledger-{}", uuid::Uuid::now_v7()))
                .join("test.db"),
        )
        .unwrap();
        let repo = Arc::new(SandboxRepo::new(db.clone()));
        let sbx = repo.create(&UserId::new(), "race", 1000, 10000).unwrap();

        // 8 threads each try 50 charges of 10 tokens: 4000 demanded, 1000 allowed
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let id = sbx.id.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0u64;
                    for _ in 0..50 {
                        if repo
                            .try_track_usage(&id, None, OperationType::ToolCall, 10, None)
                            .is_ok()
                        {
                            admitted += 10;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000);
        assert_eq!(repo.usage(&sbx.id).unwrap().hourly_usage, 1000);

        let _ = std::fs::remove_dir_all(db.path().parent().unwrap());
    }

    #[test]
    fn reset_is_idempotent() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        repo.try_track_usage(&sbx.id, None, OperationType::ToolCall, 400, None)
            .unwrap();

        let later = Utc::now() + Duration::hours(2);
        let (hourly, _) = repo.reset_elapsed_windows(later).unwrap();
        assert_eq!(hourly, 1);
        assert_eq!(repo.usage(&sbx.id).unwrap().hourly_usage, 0);

        // Same instant again: window anchor already moved, nothing to do
        let (hourly, _) = repo.reset_elapsed_windows(later).unwrap();
        assert_eq!(hourly, 0);
    }

    #[test]
    fn reset_before_window_elapses_is_noop() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        repo.try_track_usage(&sbx.id, None, OperationType::ToolCall, 400, None)
            .unwrap();

        let (hourly, daily) = repo
            .reset_elapsed_windows(Utc::now() + Duration::minutes(30))
            .unwrap();
        assert_eq!((hourly, daily), (0, 0));
        assert_eq!(repo.usage(&sbx.id).unwrap().hourly_usage, 400);
    }

    #[test]
    fn daily_reset_after_24_hours() {
        let repo = repo();
        let sbx = make_sandbox(&repo, 1000, 10000);
        repo.try_track_usage(&sbx.id, None, OperationType::ToolCall, 400, None)
            .unwrap();

        let (_, daily) = repo
            .reset_elapsed_windows(Utc::now() + Duration::hours(25))
            .unwrap();
        assert_eq!(daily, 1);
        let snap = repo.usage(&sbx.id).unwrap();
        assert_eq!(snap.daily_usage, 0);
    }

    #[test]
    fn snapshot_would_exceed() {
        let snap = UsageSnapshot {
            hourly_usage: 900,
            hourly_limit: 1000,
            daily_usage: 100,
            daily_limit: 10000,
        };
        assert!(!snap.would_exceed(100));
        assert!(snap.would_exceed(101));
    }
}
