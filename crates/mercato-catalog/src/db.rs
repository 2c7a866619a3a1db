use rusqlite::{Connection, Result};

/// Initialise catalog tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (
            id          TEXT PRIMARY KEY,
            tenant_id   TEXT NOT NULL,
            title       TEXT NOT NULL,
            description TEXT,
            price_cents INTEGER NOT NULL,
            currency    TEXT NOT NULL DEFAULT 'USD',
            stock       INTEGER NOT NULL DEFAULT 0,
            metadata    TEXT NOT NULL DEFAULT '{}',
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_tenant ON products(tenant_id, active, id);

        CREATE TABLE IF NOT EXISTS services (
            id               TEXT PRIMARY KEY,
            tenant_id        TEXT NOT NULL,
            title            TEXT NOT NULL,
            description      TEXT,
            price_cents      INTEGER NOT NULL,
            currency         TEXT NOT NULL DEFAULT 'USD',
            duration_minutes INTEGER NOT NULL DEFAULT 30,
            metadata         TEXT NOT NULL DEFAULT '{}',
            active           INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_services_tenant ON services(tenant_id, active, id);

        CREATE TABLE IF NOT EXISTS orders (
            id          TEXT PRIMARY KEY,
            tenant_id   TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            total_cents INTEGER NOT NULL,
            currency    TEXT NOT NULL DEFAULT 'USD',
            status      TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_customer
            ON orders(tenant_id, customer_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS appointments (
            id           TEXT PRIMARY KEY,
            tenant_id    TEXT NOT NULL,
            customer_id  TEXT NOT NULL,
            service_id   TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            status       TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_appointments_customer
            ON appointments(tenant_id, customer_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_appointments_service
            ON appointments(tenant_id, service_id, scheduled_at);",
    )
}
