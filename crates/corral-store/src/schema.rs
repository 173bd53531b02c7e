/// Current schema version. Bump when CREATE_TABLES changes shape.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sandboxes (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    hourly_token_limit INTEGER NOT NULL,
    daily_token_limit INTEGER NOT NULL,
    current_hourly_usage INTEGER NOT NULL DEFAULT 0,
    current_daily_usage INTEGER NOT NULL DEFAULT 0,
    hourly_reset_at TEXT NOT NULL,
    daily_reset_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sandboxes_user ON sandboxes(user_id);

CREATE TABLE IF NOT EXISTS sandbox_sessions (
    id TEXT PRIMARY KEY,
    sandbox_id TEXT NOT NULL REFERENCES sandboxes(id),
    user_id TEXT NOT NULL,
    channel TEXT NOT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_activity_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_sandbox ON sandbox_sessions(sandbox_id);
CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sandbox_sessions(is_active, last_activity_at);

CREATE TABLE IF NOT EXISTS token_usage_log (
    id TEXT PRIMARY KEY,
    sandbox_id TEXT NOT NULL REFERENCES sandboxes(id),
    session_id TEXT,
    operation_type TEXT NOT NULL,
    tokens_used INTEGER NOT NULL,
    request_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_sandbox ON token_usage_log(sandbox_id, created_at);

CREATE TABLE IF NOT EXISTS workflow_runs (
    correlation_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL,
    sandbox_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    execution TEXT NOT NULL,
    total_duration_ms INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_runs_sandbox ON workflow_runs(sandbox_id, created_at);

CREATE TABLE IF NOT EXISTS replay_log (
    correlation_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (correlation_id, sequence)
);
"#;
