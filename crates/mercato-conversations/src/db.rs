use rusqlite::{Connection, Result};

/// Initialise conversation tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id                   TEXT PRIMARY KEY,
            tenant_id            TEXT NOT NULL,
            customer_id          TEXT NOT NULL,
            state                TEXT NOT NULL DEFAULT 'open',
            channel              TEXT NOT NULL DEFAULT 'whatsapp',
            last_intent          TEXT,
            intent_confidence    REAL,
            low_confidence_count INTEGER NOT NULL DEFAULT 0,
            last_agent           TEXT,
            handoff_at           TEXT,
            metadata             TEXT NOT NULL DEFAULT '{}',
            deleted              INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_tenant
            ON conversations(tenant_id, state, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conversations_customer
            ON conversations(tenant_id, customer_id, state);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            seq             INTEGER NOT NULL,
            direction       TEXT NOT NULL,
            message_type    TEXT NOT NULL,
            text            TEXT NOT NULL,
            payload         TEXT NOT NULL DEFAULT '{}',
            provider_msg_id TEXT,
            provider_status TEXT,
            sent_at         TEXT,
            delivered_at    TEXT,
            read_at         TEXT,
            failed_at       TEXT,
            error           TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE(conversation_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_id
            ON messages(conversation_id, provider_msg_id)
            WHERE provider_msg_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS conversation_contexts (
            conversation_id     TEXT PRIMARY KEY,
            current_topic       TEXT,
            key_facts           TEXT NOT NULL DEFAULT '[]',
            summary             TEXT,
            last_product_viewed TEXT,
            last_service_viewed TEXT,
            expires_at          TEXT NOT NULL
        );",
    )
}
