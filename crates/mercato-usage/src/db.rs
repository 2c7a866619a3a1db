use rusqlite::{Connection, Result};

/// Initialise usage tables. Safe to call on every startup (idempotent).
/// Both tables are append-only audit trails.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_interactions (
            id                 TEXT PRIMARY KEY,
            tenant_id          TEXT NOT NULL,
            conversation_id    TEXT NOT NULL,
            customer_message   TEXT NOT NULL,
            detected_intents   TEXT NOT NULL DEFAULT '[]',
            model_used         TEXT NOT NULL,
            context_tokens     INTEGER NOT NULL DEFAULT 0,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            response           TEXT NOT NULL,
            confidence_score   REAL NOT NULL DEFAULT 0,
            handoff_triggered  INTEGER NOT NULL DEFAULT 0,
            handoff_reason     TEXT,
            reply_shape        TEXT NOT NULL DEFAULT 'text',
            prompt_tokens      INTEGER NOT NULL DEFAULT 0,
            completion_tokens  INTEGER NOT NULL DEFAULT 0,
            total_tokens       INTEGER NOT NULL DEFAULT 0,
            estimated_cost     REAL NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_interactions_conversation
            ON agent_interactions(tenant_id, conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS provider_usage (
            id               TEXT PRIMARY KEY,
            tenant_id        TEXT NOT NULL,
            provider         TEXT NOT NULL,
            model            TEXT NOT NULL,
            input_tokens     INTEGER NOT NULL DEFAULT 0,
            output_tokens    INTEGER NOT NULL DEFAULT 0,
            total_tokens     INTEGER NOT NULL DEFAULT 0,
            estimated_cost   REAL NOT NULL DEFAULT 0,
            latency_ms       INTEGER NOT NULL DEFAULT 0,
            success          INTEGER NOT NULL DEFAULT 1,
            finish_reason    TEXT,
            was_failover     INTEGER NOT NULL DEFAULT 0,
            routing_reason   TEXT,
            complexity_score REAL,
            interaction_id   TEXT,
            error            TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_tenant
            ON provider_usage(tenant_id, provider, created_at);",
    )
}
