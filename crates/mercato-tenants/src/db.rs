use rusqlite::{Connection, Result};

/// Initialise tenant tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            channel_number      TEXT NOT NULL UNIQUE,
            channel_credentials TEXT NOT NULL DEFAULT '{}',
            allowed_languages   TEXT NOT NULL DEFAULT '[\"en\"]',
            quiet_hours         TEXT,
            limits              TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id           TEXT PRIMARY KEY,
            tenant_id    TEXT NOT NULL,
            key_hash     TEXT NOT NULL UNIQUE,
            prefix       TEXT NOT NULL,
            label        TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            created_by   TEXT,
            last_used_at TEXT,
            revoked      INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_tenant ON api_keys(tenant_id);

        CREATE TABLE IF NOT EXISTS memberships (
            tenant_id TEXT NOT NULL,
            user_id   TEXT NOT NULL,
            scopes    TEXT NOT NULL,
            PRIMARY KEY (tenant_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS agent_settings (
            tenant_id  TEXT PRIMARY KEY,
            settings   TEXT NOT NULL,
            version    INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS customers (
            id            TEXT PRIMARY KEY,
            tenant_id     TEXT NOT NULL,
            phone         TEXT NOT NULL,
            display_name  TEXT,
            locale        TEXT,
            tags          TEXT NOT NULL DEFAULT '[]',
            first_seen_at TEXT NOT NULL,
            last_seen_at  TEXT NOT NULL,
            UNIQUE(tenant_id, phone)
        );
        CREATE INDEX IF NOT EXISTS idx_customers_tenant ON customers(tenant_id, last_seen_at DESC);

        CREATE TABLE IF NOT EXISTS customer_preferences (
            customer_id            TEXT PRIMARY KEY,
            tenant_id              TEXT NOT NULL,
            transactional_messages INTEGER NOT NULL DEFAULT 1,
            reminder_messages      INTEGER NOT NULL DEFAULT 1,
            promotional_messages   INTEGER NOT NULL DEFAULT 0,
            updated_at             TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS consent_events (
            id             TEXT PRIMARY KEY,
            tenant_id      TEXT NOT NULL,
            customer_id    TEXT NOT NULL,
            kind           TEXT NOT NULL,
            previous_value INTEGER NOT NULL,
            new_value      INTEGER NOT NULL,
            source         TEXT NOT NULL,
            reason         TEXT,
            changed_by     TEXT,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_consent_customer
            ON consent_events(tenant_id, customer_id, created_at);",
    )
}
