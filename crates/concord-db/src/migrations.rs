use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Thread store: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE records (
                id          TEXT PRIMARY KEY,
                thread_id   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                -- microseconds since the epoch, so ordering is numeric
                created_at  INTEGER NOT NULL,
                message_id  TEXT,
                payload     TEXT NOT NULL,
                consumed    INTEGER NOT NULL DEFAULT 0,
                consumed_by TEXT,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Head lookups: newest live record of one kind for one thread
            CREATE INDEX idx_records_head
                ON records(thread_id, kind, consumed, created_at);

            -- One live private copy per logical message
            CREATE UNIQUE INDEX idx_records_live_message
                ON records(message_id)
                WHERE message_id IS NOT NULL AND consumed = 0;

            -- Inputs consumed by a transition before the record itself
            -- arrived here. The record is stored already consumed.
            CREATE TABLE early_consumptions (
                record_id   TEXT PRIMARY KEY,
                consumed_by TEXT NOT NULL
            );

            CREATE TABLE transitions (
                id          TEXT PRIMARY KEY,
                thread_id   TEXT NOT NULL,
                command     TEXT NOT NULL,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
