//! Embedded schema, executed at open

/// Latest database version
pub const DB_VERSION: usize = 1;

/// Schema definition
pub const INIT_SQL: &str = r#"
-- Database settings
PRAGMA encoding = "UTF-8";
PRAGMA user_version = 1;

-- Saga instances; context and step_results are opaque serialized blobs
CREATE TABLE IF NOT EXISTS saga_instances (
    saga_id TEXT PRIMARY KEY,
    saga_type TEXT NOT NULL,
    saga_version INTEGER NOT NULL,
    status TEXT CHECK ( status IN ('pending','executing','compensating','completed','failed','compensated') ) NOT NULL,
    current_step INTEGER NOT NULL,
    step_results TEXT NOT NULL,
    context TEXT NOT NULL,
    correlation_id TEXT,
    idempotency_key TEXT UNIQUE,
    started_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    finished_at INTEGER,
    error TEXT,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS saga_status_index ON saga_instances(status);
CREATE INDEX IF NOT EXISTS saga_updated_at_index ON saga_instances(updated_at);

-- Exclusive resource leases; at most one row per resource
CREATE TABLE IF NOT EXISTS resource_locks (
    resource_key TEXT PRIMARY KEY,
    owner_saga_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS lock_owner_index ON resource_locks(owner_saga_id);

-- Finalized idempotency outcomes; immutable once written
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    saga_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Civic record rows
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    record_type TEXT NOT NULL,
    status TEXT CHECK ( status IN ('draft','published','archived') ) NOT NULL,
    body TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS record_type_index ON records(record_type);
CREATE INDEX IF NOT EXISTS record_status_index ON records(status);

-- Draft rows awaiting publication
CREATE TABLE IF NOT EXISTS drafts (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    record_type TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
