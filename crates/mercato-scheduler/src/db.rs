use rusqlite::{Connection, Result};

/// Initialise scheduler tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scheduled_messages (
            id                 TEXT PRIMARY KEY,
            tenant_id          TEXT NOT NULL,
            customer_id        TEXT,
            content            TEXT NOT NULL,
            template           TEXT,
            template_context   TEXT NOT NULL DEFAULT '{}',
            scheduled_at       TEXT NOT NULL,
            status             TEXT NOT NULL DEFAULT 'pending',
            recipient_criteria TEXT NOT NULL DEFAULT '{}',
            message_type       TEXT NOT NULL DEFAULT 'scheduled_promotional',
            sent_at            TEXT,
            failed_at          TEXT,
            error              TEXT,
            message_id         TEXT,
            metadata           TEXT NOT NULL DEFAULT '{}',
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_due
            ON scheduled_messages(status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_tenant
            ON scheduled_messages(tenant_id, status, scheduled_at);

        CREATE TABLE IF NOT EXISTS message_campaigns (
            id               TEXT PRIMARY KEY,
            tenant_id        TEXT NOT NULL,
            name             TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            message_content  TEXT NOT NULL,
            target_criteria  TEXT NOT NULL DEFAULT '{}',
            variants         TEXT NOT NULL DEFAULT '[]',
            status           TEXT NOT NULL DEFAULT 'draft',
            scheduled_at     TEXT,
            delivery_count   INTEGER NOT NULL DEFAULT 0,
            delivered_count  INTEGER NOT NULL DEFAULT 0,
            failed_count     INTEGER NOT NULL DEFAULT 0,
            read_count       INTEGER NOT NULL DEFAULT 0,
            response_count   INTEGER NOT NULL DEFAULT 0,
            conversion_count INTEGER NOT NULL DEFAULT 0,
            started_at       TEXT,
            completed_at     TEXT,
            created_by       TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_campaigns_tenant
            ON message_campaigns(tenant_id, status);",
    )
}
