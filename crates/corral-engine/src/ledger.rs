use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use corral_core::ids::{RequestId, SandboxId, SessionId};
use corral_store::sandboxes::{SandboxRepo, UsageSnapshot};
use corral_store::usage_log::OperationType;
use corral_store::StoreError;

use crate::error::EngineError;

/// Fronts the sandbox budget windows. Admission control is a single
/// conditional UPDATE in the store, so the advisory check here is only
/// used to refuse obviously oversized requests before any work happens.
pub struct BudgetLedger {
    sandboxes: Arc<SandboxRepo>,
}

impl BudgetLedger {
    pub fn new(sandboxes: Arc<SandboxRepo>) -> Self {
        Self { sandboxes }
    }

    /// Advisory pre-check against the current snapshot. A passing result
    /// does not reserve anything; `charge` is the authoritative gate.
    /// Deactivated sandboxes are refused here, before any work happens.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, estimated_tokens))]
    pub fn check_rate_limit(
        &self,
        sandbox_id: &SandboxId,
        estimated_tokens: u64,
    ) -> Result<UsageSnapshot, EngineError> {
        let sandbox = self.sandboxes.get(sandbox_id)?;
        if !sandbox.is_active {
            return Err(EngineError::SandboxInactive(sandbox_id.to_string()));
        }
        let snapshot = UsageSnapshot {
            hourly_usage: sandbox.current_hourly_usage,
            hourly_limit: sandbox.hourly_token_limit,
            daily_usage: sandbox.current_daily_usage,
            daily_limit: sandbox.daily_token_limit,
        };
        if snapshot.would_exceed(estimated_tokens) {
            return Err(EngineError::RateLimitExceeded {
                sandbox_id: sandbox_id.to_string(),
                state: snapshot,
            });
        }
        Ok(snapshot)
    }

    /// Atomically charge tokens against both windows. On refusal the
    /// budget is untouched and the returned error carries the state.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, tokens))]
    pub fn charge(
        &self,
        sandbox_id: &SandboxId,
        session_id: Option<&SessionId>,
        operation_type: OperationType,
        tokens: u64,
        request_id: Option<&RequestId>,
    ) -> Result<UsageSnapshot, EngineError> {
        self.sandboxes
            .try_track_usage(sandbox_id, session_id, operation_type, tokens, request_id)
            .map_err(|e| match e {
                StoreError::Conflict(_) => EngineError::SandboxInactive(sandbox_id.to_string()),
                other => other.into(),
            })
    }

    pub fn usage(&self, sandbox_id: &SandboxId) -> Result<UsageSnapshot, EngineError> {
        Ok(self.sandboxes.usage(sandbox_id)?)
    }

    /// Spawn the periodic window sweep. Resets are idempotent, so running
    /// the sweep more often than once per window is harmless.
    pub fn start_reset_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("budget reset task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match ledger.sandboxes.reset_elapsed_windows(Utc::now()) {
                            Ok((hourly, daily)) if hourly > 0 || daily > 0 => {
                                info!(hourly, daily, "budget windows reset");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "budget window sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
