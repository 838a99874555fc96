use rusqlite::Connection;

use crate::error::Result;

/// Initialise the control store schema in `conn`.
///
/// The admin backend normally owns these tables; creating them here is
/// idempotent (`IF NOT EXISTS` throughout) and only matters for fresh
/// installs and tests.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS database_connections (
            id                 INTEGER PRIMARY KEY,
            name               TEXT    NOT NULL,
            engine             TEXT    NOT NULL,
            host               TEXT    NOT NULL,
            port               INTEGER NOT NULL,
            database           TEXT    NOT NULL,
            username           TEXT    NOT NULL,
            encrypted_password TEXT,             -- '<ivHex>:<payloadHex>' or legacy plaintext
            ssl_enabled        INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_tasks (
            id                   INTEGER PRIMARY KEY,
            name                 TEXT    NOT NULL,
            schedule             TEXT,           -- hourly | daily | weekly | never
            tables               TEXT,           -- JSON array of table names or NULL
            enabled              INTEGER NOT NULL DEFAULT 1,
            source_connection_id INTEGER NOT NULL REFERENCES database_connections(id),
            target_connection_id INTEGER NOT NULL REFERENCES database_connections(id),
            last_sync            TEXT,           -- ISO-8601 of the last successful run
            updated_at           TEXT
        );

        CREATE TABLE IF NOT EXISTS sync_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     INTEGER NOT NULL,
            start_time  TEXT    NOT NULL,
            end_time    TEXT    NOT NULL,
            status      TEXT    NOT NULL,        -- success | error
            message     TEXT,
            rows_synced INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_sync_logs_task
            ON sync_logs (task_id, start_time DESC);
        ",
    )?;
    Ok(())
}
