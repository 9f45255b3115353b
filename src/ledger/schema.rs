//! Ledger tables
//!
//! Timestamps are epoch milliseconds. Record tables are insert-only; only
//! `operations.status` and `executions.undo_consumed` ever change, and
//! both change through compare-and-set updates.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            directive TEXT NOT NULL,
            requester TEXT NOT NULL,
            destination TEXT,
            consumer TEXT,
            semantics TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            failure TEXT,
            parent_id TEXT REFERENCES operations(id),
            position INTEGER NOT NULL DEFAULT 0,
            request_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_operations_requester
            ON operations(requester, created_at);
        CREATE INDEX IF NOT EXISTS idx_operations_parent
            ON operations(parent_id, position);
        CREATE INDEX IF NOT EXISTS idx_operations_hash
            ON operations(requester, request_hash);

        CREATE TABLE IF NOT EXISTS classification_reasoning (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT NOT NULL REFERENCES operations(id),
            strategy TEXT NOT NULL,
            reasoning TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS features (
            operation_id TEXT PRIMARY KEY REFERENCES operations(id),
            request_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            record TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verification_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT NOT NULL REFERENCES operations(id),
            layer TEXT NOT NULL,
            position INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            skipped INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL,
            issues TEXT NOT NULL,
            details TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(operation_id, layer)
        );

        CREATE TABLE IF NOT EXISTS executions (
            operation_id TEXT PRIMARY KEY REFERENCES operations(id),
            executor TEXT NOT NULL,
            success INTEGER NOT NULL,
            simulated INTEGER NOT NULL DEFAULT 0,
            reversible INTEGER NOT NULL,
            undo_consumed INTEGER NOT NULL DEFAULT 0,
            record TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feedback_events (
            id TEXT PRIMARY KEY,
            operation_id TEXT NOT NULL REFERENCES operations(id),
            requester TEXT NOT NULL,
            channel TEXT NOT NULL,
            payload TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_feedback_operation
            ON feedback_events(operation_id);
        CREATE INDEX IF NOT EXISTS idx_feedback_requester
            ON feedback_events(requester, channel, created_at);

        CREATE TABLE IF NOT EXISTS learning_snapshots (
            id TEXT PRIMARY KEY,
            requester TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            accuracy REAL,
            improvement REAL,
            snapshot TEXT NOT NULL,
            computed_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_requester
            ON learning_snapshots(requester, computed_at);
        "#,
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
