//! SQL schema for the retrieval store.

pub const SCHEMA_VERSION: i32 = 1;

pub const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);
INSERT OR IGNORE INTO schema_version (version) VALUES (1);

CREATE TABLE IF NOT EXISTS jobs (
    id                  TEXT PRIMARY KEY,
    kind                TEXT NOT NULL,
    params              TEXT NOT NULL,
    status              TEXT NOT NULL,
    idempotency_key     TEXT,
    retry_of            TEXT,
    lease_owner         TEXT,
    lease_expires_at    TEXT,
    attempt_count       INTEGER NOT NULL DEFAULT 0,
    progress            INTEGER NOT NULL DEFAULT 0,
    result              TEXT,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    finished_at          TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

CREATE TABLE IF NOT EXISTS job_events (
    job_id      TEXT NOT NULL,
    event_id    INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    ts          TEXT NOT NULL,
    PRIMARY KEY (job_id, event_id)
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key             TEXT PRIMARY KEY,
    job_id          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS reports (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    original_query      TEXT NOT NULL,
    final_report        TEXT NOT NULL,
    query_embedding     TEXT NOT NULL,
    metadata            TEXT,
    created_at          TEXT NOT NULL,
    rating              INTEGER
);

CREATE TABLE IF NOT EXISTS index_documents (
    source_type     TEXT NOT NULL,
    source_id       TEXT NOT NULL,
    title           TEXT NOT NULL,
    content         TEXT NOT NULL,
    doc_embedding   TEXT,
    doc_len         INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (source_type, source_id)
);

CREATE TABLE IF NOT EXISTS cache_entries (
    fingerprint     TEXT PRIMARY KEY,
    bucket          TEXT NOT NULL,
    result          TEXT NOT NULL,
    query_embedding TEXT,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    hit_count       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cache_bucket ON cache_entries(bucket);
";
