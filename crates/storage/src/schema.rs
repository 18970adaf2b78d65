use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS records (
    record_id BLOB PRIMARY KEY CHECK (length(record_id) = 16),
    version_vector BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    updated_at BLOB NOT NULL CHECK (length(updated_at) = 12),
    state BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS oplog (
    rowid INTEGER PRIMARY KEY,
    op_id BLOB NOT NULL UNIQUE CHECK (length(op_id) = 16),
    record_id BLOB CHECK (record_id IS NULL OR length(record_id) = 16),
    actor_id TEXT NOT NULL,
    lamport INTEGER NOT NULL,
    hlc BLOB NOT NULL CHECK (length(hlc) = 12),
    op_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    received_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
CREATE INDEX IF NOT EXISTS idx_oplog_record ON oplog (record_id, rowid);
CREATE INDEX IF NOT EXISTS idx_oplog_actor ON oplog (actor_id, lamport);

CREATE TABLE IF NOT EXISTS relationships (
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    target_id BLOB NOT NULL CHECK (length(target_id) = 16),
    relationship_type TEXT NOT NULL,
    weight REAL NOT NULL CHECK (weight >= 0.0 AND weight <= 1.0),
    status TEXT NOT NULL,
    state BLOB NOT NULL,
    PRIMARY KEY (source_id, target_id, relationship_type)
);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships (target_id, relationship_type);

CREATE TABLE IF NOT EXISTS vector_states (
    record_id BLOB PRIMARY KEY CHECK (length(record_id) = 16),
    content_hash TEXT NOT NULL,
    embedding_model TEXT NOT NULL,
    generation_timestamp BLOB NOT NULL CHECK (length(generation_timestamp) = 12),
    consistency_checksum TEXT NOT NULL,
    state BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_trail (
    sequence INTEGER PRIMARY KEY,
    conflict_id BLOB NOT NULL CHECK (length(conflict_id) = 16),
    previous_hash TEXT NOT NULL,
    entry_hash TEXT NOT NULL UNIQUE,
    entry BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_conflict ON audit_trail (conflict_id, sequence);

CREATE TABLE IF NOT EXISTS replay_queue (
    replay_id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id BLOB CHECK (record_id IS NULL OR length(record_id) = 16),
    op_id BLOB NOT NULL CHECK (length(op_id) = 16),
    reason TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    payload BLOB NOT NULL,
    queued_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
";
