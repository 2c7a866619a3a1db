use rusqlite::{Connection, Result};

/// Initialise knowledge tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_entries (
            id         TEXT PRIMARY KEY,
            tenant_id  TEXT NOT NULL,
            kind       TEXT NOT NULL,
            title      TEXT NOT NULL,
            content    TEXT NOT NULL,
            category   TEXT,
            keywords   TEXT NOT NULL DEFAULT '',
            embedding  TEXT,
            metadata   TEXT NOT NULL DEFAULT '{}',
            priority   INTEGER NOT NULL DEFAULT 0,
            active     INTEGER NOT NULL DEFAULT 1,
            version    INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_tenant
            ON knowledge_entries(tenant_id, active, kind);",
    )
}
