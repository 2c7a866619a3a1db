use rusqlite::{Connection, Result};

/// Initialise the message queue table. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message_queue (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id       TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            message_id      TEXT NOT NULL,
            text            TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'queued',
            queued_at       TEXT NOT NULL,
            processed_at    TEXT,
            error           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_conversation
            ON message_queue(conversation_id, status, queued_at);",
    )
}
