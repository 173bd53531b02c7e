use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use corral_core::events::ReplayKind;
use corral_core::ids::CorrelationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub correlation_id: CorrelationId,
    pub sequence: u64,
    pub kind: ReplayKind,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Append-only log of execution history, keyed by correlation id.
/// Sequence numbers are dense per correlation (0, 1, 2, ...), assigned
/// under a per-correlation lock so appends from concurrent tasks never
/// collide or leave gaps.
pub struct ReplayRepo {
    db: Database,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReplayRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, correlation_id: &CorrelationId) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock();
        locks
            .entry(correlation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an entry, assigning the next sequence number.
    #[instrument(skip(self, payload), fields(correlation_id = %correlation_id, kind = %kind))]
    pub fn append(
        &self,
        correlation_id: &CorrelationId,
        kind: ReplayKind,
        payload: serde_json::Value,
    ) -> Result<ReplayEntry, StoreError> {
        let lock = self.lock_for(correlation_id);
        let _guard = lock.lock();

        let now = Utc::now().to_rfc3339();
        let payload_s = serde_json::to_string(&payload)?;

        self.db.with_conn(|conn| {
            let next: u64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence) + 1, 0) FROM replay_log WHERE correlation_id = ?1",
                [correlation_id.as_str()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO replay_log (correlation_id, sequence, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![correlation_id.as_str(), next, kind.to_string(), payload_s, now],
            )?;

            Ok(ReplayEntry {
                correlation_id: correlation_id.clone(),
                sequence: next,
                kind,
                payload,
                created_at: now,
            })
        })
    }

    /// List all entries for a correlation, in sequence order.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub fn list(&self, correlation_id: &CorrelationId) -> Result<Vec<ReplayEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT correlation_id, sequence, kind, payload, created_at
                 FROM replay_log WHERE correlation_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([correlation_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_entry(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ReplayEntry, StoreError> {
    let correlation_id: String = row_helpers::get(row, 0, "replay_log", "correlation_id")?;
    let kind_raw: String = row_helpers::get(row, 2, "replay_log", "kind")?;
    let payload_raw: String = row_helpers::get(row, 3, "replay_log", "payload")?;
    Ok(ReplayEntry {
        correlation_id: CorrelationId::from_raw(correlation_id),
        sequence: row_helpers::get(row, 1, "replay_log", "sequence")?,
        kind: row_helpers::parse_enum(&kind_raw, "replay_log", "kind")?,
        payload: row_helpers::parse_json(&payload_raw, "replay_log", "payload")?,
        created_at: row_helpers::get(row, 4, "replay_log", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> ReplayRepo {
        ReplayRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn sequences_are_dense_per_correlation() {
        let repo = repo();
        let corr = CorrelationId::new();
        let other = CorrelationId::new();

        for kind in [
            ReplayKind::AdmissionGranted,
            ReplayKind::ToolStart,
            ReplayKind::ToolComplete,
        ] {
            repo.append(&corr, kind, serde_json::json!({})).unwrap();
        }
        repo.append(&other, ReplayKind::AdmissionDenied, serde_json::json!({}))
            .unwrap();

        let entries = repo.list(&corr).unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(repo.list(&other).unwrap()[0].sequence, 0);
    }

    #[test]
    fn list_preserves_append_order_and_payloads() {
        let repo = repo();
        let corr = CorrelationId::new();

        repo.append(
            &corr,
            ReplayKind::ToolStart,
            serde_json::json!({"tool": "crm.lookup", "estimated_tokens": 42}),
        )
        .unwrap();
        repo.append(
            &corr,
            ReplayKind::ToolError,
            serde_json::json!({"error": "upstream timeout"}),
        )
        .unwrap();

        let entries = repo.list(&corr).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ReplayKind::ToolStart);
        assert_eq!(entries[0].payload["tool"], "crm.lookup");
        assert_eq!(entries[1].kind, ReplayKind::ToolError);
    }

    #[test]
    fn unknown_correlation_lists_empty() {
        let repo = repo();
        assert!(repo.list(&CorrelationId::new()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_never_collide() {
        use std::sync::Arc;

        let repo = Arc::new(repo());
        let corr = CorrelationId::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let corr = corr.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        repo.append(&corr, ReplayKind::ToolStart, serde_json::json!({}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = repo.list(&corr).unwrap();
        assert_eq!(entries.len(), 100);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64);
        }
    }
}
