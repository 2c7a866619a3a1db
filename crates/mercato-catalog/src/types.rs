use serde::{Deserialize, Serialize};

use mercato_core::money::Money;
use mercato_core::types::{CustomerId, TenantId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub tenant_id: TenantId,
    pub title: String,
    pub description: Option<String>,
    pub price: Money,
    pub currency: String,
    pub stock: i64,
    pub metadata: serde_json::Value,
    pub active: bool,
    pub created_at: String,
}

impl Product {
    pub fn in_stock(&self) -> bool {
        self.stock > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub tenant_id: TenantId,
    pub title: String,
    pub description: Option<String>,
    pub price: Money,
    pub currency: String,
    pub duration_minutes: i64,
    pub metadata: serde_json::Value,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub total: Money,
    pub currency: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub service_id: String,
    pub scheduled_at: String,
    pub status: String,
    pub created_at: String,
}

/// One page of a cursor-paginated listing. `next_cursor` is the id of the
/// last row; pass it back to continue.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Recent orders/appointments plus aggregate spend for one customer.
#[derive(Debug, Clone, Default)]
pub struct CustomerHistory {
    pub orders: Vec<Order>,
    pub appointments: Vec<Appointment>,
    pub total_orders: i64,
    pub total_appointments: i64,
    pub total_spent: Money,
}
