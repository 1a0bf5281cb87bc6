//! SQL migration definitions for the cartograph database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: entities, fact_records, jobs, provider_state, change_records",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Enrolled entities (domains and keyword batches)
CREATE TABLE IF NOT EXISTS entities (
    entity_id  TEXT PRIMARY KEY,
    kind       TEXT NOT NULL,
    priority   INTEGER NOT NULL DEFAULT 5,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Current merged fact record per entity, with its applied-key window
CREATE TABLE IF NOT EXISTS fact_records (
    entity_id         TEXT PRIMARY KEY,
    schema_version    INTEGER NOT NULL,
    last_updated_at   TEXT,
    record_json       TEXT NOT NULL,
    applied_keys_json TEXT NOT NULL DEFAULT '[]'
);

-- Jobs: active, retired and dead-lettered
CREATE TABLE IF NOT EXISTS jobs (
    job_id          TEXT PRIMARY KEY,
    agent_type      TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    attempt_count   INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    provider_id     TEXT,
    scheduled_at    TEXT NOT NULL,
    not_before      TEXT NOT NULL,
    job_json        TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_entity ON jobs(entity_id, agent_type);

-- Circuit breaker state per provider
CREATE TABLE IF NOT EXISTS provider_state (
    provider_id          TEXT PRIMARY KEY,
    state                TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    opened_at            TEXT,
    next_probe_at        TEXT,
    cooldown_secs        INTEGER NOT NULL,
    open_events          INTEGER NOT NULL DEFAULT 0,
    updated_at           TEXT NOT NULL
);

-- Change records: append-only, partitioned by month of period_end
CREATE TABLE IF NOT EXISTS change_records (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id      TEXT NOT NULL,
    period_start   TEXT NOT NULL,
    period_end     TEXT NOT NULL,
    period_month   TEXT NOT NULL,
    trending_score REAL NOT NULL,
    record_json    TEXT NOT NULL,
    recorded_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_records_entity ON change_records(entity_id, period_end);
CREATE INDEX IF NOT EXISTS idx_change_records_month ON change_records(period_month);

CREATE TRIGGER IF NOT EXISTS change_records_no_update BEFORE UPDATE ON change_records BEGIN
    SELECT RAISE(ABORT, 'change_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS change_records_no_delete BEFORE DELETE ON change_records BEGIN
    SELECT RAISE(ABORT, 'change_records is append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Change-record idempotency keys and persisted snapshots",
            sql: r#"
-- One change record per change-tracking job; older rows have no key
ALTER TABLE change_records ADD COLUMN idempotency_key TEXT;
CREATE UNIQUE INDEX IF NOT EXISTS idx_change_records_key ON change_records(idempotency_key);

-- Rolling fact-record snapshots the change detector diffs against
CREATE TABLE IF NOT EXISTS snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id   TEXT NOT NULL,
    taken_at    TEXT NOT NULL,
    record_json TEXT NOT NULL,
    UNIQUE(entity_id, taken_at)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_entity ON snapshots(entity_id, id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
