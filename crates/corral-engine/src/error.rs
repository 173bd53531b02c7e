use std::time::Duration;

use corral_core::errors::AdapterError;
use corral_store::sandboxes::UsageSnapshot;
use corral_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("rate limit exceeded for sandbox {sandbox_id}")]
    RateLimitExceeded {
        sandbox_id: String,
        state: UsageSnapshot,
    },

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("sandbox {0} is not active")]
    SandboxInactive(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code carried on the wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Adapter(_) => "ADAPTER_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SandboxInactive(_) => "SANDBOX_INACTIVE",
            Self::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            Self::Timeout(_) => "TIMEOUT",
            Self::Store(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LimitExceeded {
                sandbox_id,
                hourly_usage,
                hourly_limit,
                daily_usage,
                daily_limit,
            } => Self::RateLimitExceeded {
                sandbox_id,
                state: UsageSnapshot {
                    hourly_usage,
                    hourly_limit,
                    daily_usage,
                    daily_limit,
                },
            },
            StoreError::NotFound(what) if what.starts_with("session") => {
                Self::SessionNotFound(what)
            }
            other => Self::Store(other),
        }
    }
}
