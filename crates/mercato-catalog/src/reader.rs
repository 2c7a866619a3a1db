use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use mercato_core::money::Money;
use mercato_core::types::{CustomerId, TenantId};

use crate::db::init_db;
use crate::error::Result;
use crate::types::*;

/// Catalog slices are cached briefly; customer history a little longer.
const CATALOG_CACHE_TTL_SECS: u64 = 60;
const HISTORY_CACHE_TTL_SECS: u64 = 300;

struct CachedSlice {
    products: Vec<Product>,
    services: Vec<Service>,
    stored_at: Instant,
}

struct CachedHistory {
    history: CustomerHistory,
    stored_at: Instant,
}

/// Read-side views over products, services, orders and appointments.
///
/// The tenant filter is baked into every query. Caches use versioned keys:
/// writes bump the tenant's version counter so stale entries become
/// unreachable rather than being invalidated in place.
pub struct CatalogReader {
    db: Arc<Mutex<Connection>>,
    slice_cache: DashMap<String, CachedSlice>,
    history_cache: DashMap<String, CachedHistory>,
    tenant_versions: DashMap<String, u64>,
}

impl CatalogReader {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            slice_cache: DashMap::new(),
            history_cache: DashMap::new(),
            tenant_versions: DashMap::new(),
        })
    }

    // ── listings ─────────────────────────────────────────────────────────────

    /// Active products, cursor-paginated, optionally filtered by a
    /// case-insensitive text match on title/description.
    pub fn list_products(
        &self,
        tenant_id: &TenantId,
        filter: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Product>> {
        let db = self.db.lock().unwrap();
        let pattern = filter.map(|f| format!("%{}%", f.to_lowercase()));
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, title, description, price_cents, currency, stock,
                    metadata, active, created_at
             FROM products
             WHERE tenant_id = ?1 AND active = 1 AND id > ?2
               AND (?3 IS NULL OR lower(title) LIKE ?3 OR lower(COALESCE(description,'')) LIKE ?3)
             ORDER BY id LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                tenant_id.as_str(),
                cursor.unwrap_or(""),
                pattern,
                limit as i64
            ],
            row_to_product,
        )?;
        let items: Vec<Product> = rows.filter_map(|r| r.ok()).collect();
        let next_cursor = (limit > 0 && items.len() == limit).then(|| items.last().unwrap().id.clone());
        Ok(Page { items, next_cursor })
    }

    pub fn list_services(
        &self,
        tenant_id: &TenantId,
        filter: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Service>> {
        let db = self.db.lock().unwrap();
        let pattern = filter.map(|f| format!("%{}%", f.to_lowercase()));
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, title, description, price_cents, currency,
                    duration_minutes, metadata, active, created_at
             FROM services
             WHERE tenant_id = ?1 AND active = 1 AND id > ?2
               AND (?3 IS NULL OR lower(title) LIKE ?3 OR lower(COALESCE(description,'')) LIKE ?3)
             ORDER BY id LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                tenant_id.as_str(),
                cursor.unwrap_or(""),
                pattern,
                limit as i64
            ],
            row_to_service,
        )?;
        let items: Vec<Service> = rows.filter_map(|r| r.ok()).collect();
        let next_cursor = (limit > 0 && items.len() == limit).then(|| items.last().unwrap().id.clone());
        Ok(Page { items, next_cursor })
    }

    /// The catalog slice used during context assembly: up to `max_items`
    /// products and services each, filtered by the query when present.
    /// Cached for a short TTL keyed by (tenant version, filter).
    pub fn catalog_slice(
        &self,
        tenant_id: &TenantId,
        filter: Option<&str>,
        max_items: usize,
    ) -> Result<(Vec<Product>, Vec<Service>)> {
        let key = format!(
            "{}:{}:{}:{}",
            tenant_id.as_str(),
            self.version(tenant_id),
            max_items,
            filter.unwrap_or(""),
        );
        if let Some(hit) = self.slice_cache.get(&key) {
            if hit.stored_at.elapsed().as_secs() < CATALOG_CACHE_TTL_SECS {
                debug!(tenant_id = %tenant_id, "catalog slice cache hit");
                return Ok((hit.products.clone(), hit.services.clone()));
            }
        }

        let products = self.list_products(tenant_id, filter, None, max_items)?.items;
        let services = self.list_services(tenant_id, filter, None, max_items)?.items;

        // A filtered query with no hits falls back to the unfiltered slice so
        // the agent still sees what the tenant sells.
        let (products, services) = if filter.is_some() && products.is_empty() && services.is_empty()
        {
            (
                self.list_products(tenant_id, None, None, max_items)?.items,
                self.list_services(tenant_id, None, None, max_items)?.items,
            )
        } else {
            (products, services)
        };

        self.slice_cache.insert(
            key,
            CachedSlice {
                products: products.clone(),
                services: services.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok((products, services))
    }

    /// Point lookup used to resolve last-viewed references; inactive rows
    /// resolve to `None`.
    pub fn get_product(&self, tenant_id: &TenantId, id: &str) -> Result<Option<Product>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, title, description, price_cents, currency, stock,
                    metadata, active, created_at
             FROM products WHERE tenant_id = ?1 AND id = ?2 AND active = 1",
            rusqlite::params![tenant_id.as_str(), id],
            row_to_product,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    pub fn get_service(&self, tenant_id: &TenantId, id: &str) -> Result<Option<Service>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, title, description, price_cents, currency,
                    duration_minutes, metadata, active, created_at
             FROM services WHERE tenant_id = ?1 AND id = ?2 AND active = 1",
            rusqlite::params![tenant_id.as_str(), id],
            row_to_service,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    // ── customer history ─────────────────────────────────────────────────────

    /// Recent orders and appointments plus aggregate spend; spend counts only
    /// completed/paid orders.
    pub fn customer_history(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        max_items: usize,
    ) -> Result<CustomerHistory> {
        let key = format!(
            "{}:{}:{}:{}",
            tenant_id.as_str(),
            self.version(tenant_id),
            customer_id.as_str(),
            max_items
        );
        if let Some(hit) = self.history_cache.get(&key) {
            if hit.stored_at.elapsed().as_secs() < HISTORY_CACHE_TTL_SECS {
                return Ok(hit.history.clone());
            }
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, customer_id, total_cents, currency, status, created_at
             FROM orders WHERE tenant_id = ?1 AND customer_id = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let orders: Vec<Order> = stmt
            .query_map(
                rusqlite::params![tenant_id.as_str(), customer_id.as_str(), max_items as i64],
                row_to_order,
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let total_orders: i64 = db.query_row(
            "SELECT COUNT(*) FROM orders WHERE tenant_id = ?1 AND customer_id = ?2",
            rusqlite::params![tenant_id.as_str(), customer_id.as_str()],
            |row| row.get(0),
        )?;
        let total_spent_cents: i64 = db.query_row(
            "SELECT COALESCE(SUM(total_cents), 0) FROM orders
             WHERE tenant_id = ?1 AND customer_id = ?2 AND status IN ('completed', 'paid')",
            rusqlite::params![tenant_id.as_str(), customer_id.as_str()],
            |row| row.get(0),
        )?;

        let mut stmt = db.prepare(
            "SELECT id, tenant_id, customer_id, service_id, scheduled_at, status, created_at
             FROM appointments WHERE tenant_id = ?1 AND customer_id = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let appointments: Vec<Appointment> = stmt
            .query_map(
                rusqlite::params![tenant_id.as_str(), customer_id.as_str(), max_items as i64],
                row_to_appointment,
            )?
            .filter_map(|r| r.ok())
            .collect();

        let total_appointments: i64 = db.query_row(
            "SELECT COUNT(*) FROM appointments WHERE tenant_id = ?1 AND customer_id = ?2",
            rusqlite::params![tenant_id.as_str(), customer_id.as_str()],
            |row| row.get(0),
        )?;
        drop(stmt);
        drop(db);

        let history = CustomerHistory {
            orders,
            appointments,
            total_orders,
            total_appointments,
            total_spent: Money::from_cents(total_spent_cents),
        };
        self.history_cache.insert(
            key,
            CachedHistory {
                history: history.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(history)
    }

    /// Count of appointments booked against a service inside a time window.
    /// Used by the suggestion builder's 7-day availability check.
    pub fn appointments_for_service_between(
        &self,
        tenant_id: &TenantId,
        service_id: &str,
        from: &str,
        to: &str,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row(
            "SELECT COUNT(*) FROM appointments
             WHERE tenant_id = ?1 AND service_id = ?2
               AND scheduled_at >= ?3 AND scheduled_at < ?4
               AND status NOT IN ('canceled')",
            rusqlite::params![tenant_id.as_str(), service_id, from, to],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ── seed-side writes ─────────────────────────────────────────────────────
    // The catalog is owned by an external collaborator; these writers exist
    // for provisioning and tests. Each bumps the tenant version so cached
    // read views roll over.

    pub fn add_product(
        &self,
        tenant_id: &TenantId,
        title: &str,
        description: Option<&str>,
        price: Money,
        currency: &str,
        stock: i64,
        metadata: serde_json::Value,
    ) -> Result<Product> {
        let product = Product {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            title: title.to_string(),
            description: description.map(String::from),
            price,
            currency: currency.to_string(),
            stock,
            metadata,
            active: true,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO products
             (id, tenant_id, title, description, price_cents, currency, stock,
              metadata, active, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,1,?9)",
            rusqlite::params![
                product.id,
                tenant_id.as_str(),
                product.title,
                product.description,
                product.price.cents,
                product.currency,
                product.stock,
                serde_json::to_string(&product.metadata)?,
                product.created_at,
            ],
        )?;
        drop(db);
        self.bump_version(tenant_id);
        Ok(product)
    }

    pub fn add_service(
        &self,
        tenant_id: &TenantId,
        title: &str,
        description: Option<&str>,
        price: Money,
        currency: &str,
        duration_minutes: i64,
    ) -> Result<Service> {
        let service = Service {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            title: title.to_string(),
            description: description.map(String::from),
            price,
            currency: currency.to_string(),
            duration_minutes,
            metadata: serde_json::json!({}),
            active: true,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO services
             (id, tenant_id, title, description, price_cents, currency,
              duration_minutes, metadata, active, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'{}',1,?8)",
            rusqlite::params![
                service.id,
                tenant_id.as_str(),
                service.title,
                service.description,
                service.price.cents,
                service.currency,
                service.duration_minutes,
                service.created_at,
            ],
        )?;
        drop(db);
        self.bump_version(tenant_id);
        Ok(service)
    }

    pub fn add_order(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        total: Money,
        currency: &str,
        status: &str,
    ) -> Result<Order> {
        let order = Order {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            customer_id: customer_id.clone(),
            total,
            currency: currency.to_string(),
            status: status.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO orders
             (id, tenant_id, customer_id, total_cents, currency, status, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                order.id,
                tenant_id.as_str(),
                customer_id.as_str(),
                order.total.cents,
                order.currency,
                order.status,
                order.created_at,
            ],
        )?;
        drop(db);
        self.bump_version(tenant_id);
        Ok(order)
    }

    pub fn add_appointment(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        service_id: &str,
        scheduled_at: &str,
        status: &str,
    ) -> Result<Appointment> {
        let appointment = Appointment {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            customer_id: customer_id.clone(),
            service_id: service_id.to_string(),
            scheduled_at: scheduled_at.to_string(),
            status: status.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO appointments
             (id, tenant_id, customer_id, service_id, scheduled_at, status, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                appointment.id,
                tenant_id.as_str(),
                customer_id.as_str(),
                appointment.service_id,
                appointment.scheduled_at,
                appointment.status,
                appointment.created_at,
            ],
        )?;
        drop(db);
        self.bump_version(tenant_id);
        Ok(appointment)
    }

    fn version(&self, tenant_id: &TenantId) -> u64 {
        self.tenant_versions
            .get(tenant_id.as_str())
            .map(|v| *v)
            .unwrap_or(0)
    }

    fn bump_version(&self, tenant_id: &TenantId) {
        *self
            .tenant_versions
            .entry(tenant_id.as_str().to_string())
            .or_insert(0) += 1;
    }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    let metadata: String = row.get(7)?;
    Ok(Product {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        description: row.get(3)?,
        price: Money::from_cents(row.get(4)?),
        currency: row.get(5)?,
        stock: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        active: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
    let metadata: String = row.get(7)?;
    Ok(Service {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        title: row.get(2)?,
        description: row.get(3)?,
        price: Money::from_cents(row.get(4)?),
        currency: row.get(5)?,
        duration_minutes: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        active: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        customer_id: CustomerId::from(row.get::<_, String>(2)?),
        total: Money::from_cents(row.get(3)?),
        currency: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_appointment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        customer_id: CustomerId::from(row.get::<_, String>(2)?),
        service_id: row.get(3)?,
        scheduled_at: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> CatalogReader {
        CatalogReader::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn listing_is_tenant_scoped() {
        let reader = reader();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        reader
            .add_product(
                &tenant_a,
                "Blue Shirt",
                None,
                Money::from_cents(2999),
                "USD",
                5,
                serde_json::json!({}),
            )
            .unwrap();

        let page = reader.list_products(&tenant_b, None, None, 10).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn cursor_pagination_walks_all_rows() {
        let reader = reader();
        let tenant = TenantId::new();
        for i in 0..5 {
            reader
                .add_product(
                    &tenant,
                    &format!("Item {i}"),
                    None,
                    Money::from_cents(1000 + i),
                    "USD",
                    1,
                    serde_json::json!({}),
                )
                .unwrap();
        }

        let first = reader.list_products(&tenant, None, None, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.expect("more pages");
        let second = reader
            .list_products(&tenant, None, Some(&cursor), 10)
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn text_filter_matches_title_and_description() {
        let reader = reader();
        let tenant = TenantId::new();
        reader
            .add_product(
                &tenant,
                "Blue Shirt",
                Some("100% cotton, slim fit"),
                Money::from_cents(2999),
                "USD",
                5,
                serde_json::json!({}),
            )
            .unwrap();
        reader
            .add_product(
                &tenant,
                "Red Mug",
                Some("ceramic"),
                Money::from_cents(999),
                "USD",
                3,
                serde_json::json!({}),
            )
            .unwrap();

        let by_title = reader
            .list_products(&tenant, Some("shirt"), None, 10)
            .unwrap();
        assert_eq!(by_title.items.len(), 1);
        let by_description = reader
            .list_products(&tenant, Some("cotton"), None, 10)
            .unwrap();
        assert_eq!(by_description.items.len(), 1);
    }

    #[test]
    fn spend_counts_only_settled_orders() {
        let reader = reader();
        let tenant = TenantId::new();
        let customer = CustomerId::new();
        reader
            .add_order(&tenant, &customer, Money::from_cents(5000), "USD", "completed")
            .unwrap();
        reader
            .add_order(&tenant, &customer, Money::from_cents(3000), "USD", "paid")
            .unwrap();
        reader
            .add_order(&tenant, &customer, Money::from_cents(9999), "USD", "canceled")
            .unwrap();

        let history = reader.customer_history(&tenant, &customer, 5).unwrap();
        assert_eq!(history.total_orders, 3);
        assert_eq!(history.total_spent, Money::from_cents(8000));
    }

    #[test]
    fn unmatched_filter_falls_back_to_full_slice() {
        let reader = reader();
        let tenant = TenantId::new();
        reader
            .add_product(
                &tenant,
                "Blue Shirt",
                None,
                Money::from_cents(2999),
                "USD",
                5,
                serde_json::json!({}),
            )
            .unwrap();

        let (products, _) = reader
            .catalog_slice(&tenant, Some("nonexistent widget"), 10)
            .unwrap();
        assert_eq!(products.len(), 1);
    }
}
