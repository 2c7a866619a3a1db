//! Proactive suggestions: complementary products around the customer's
//! anchor price and services bookable in the coming week.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::debug;

use mercato_catalog::types::{CustomerHistory, Product, Service};
use mercato_catalog::CatalogReader;
use mercato_core::types::TenantId;

const MAX_SUGGESTED_PRODUCTS: usize = 3;
const MAX_SUGGESTED_SERVICES: usize = 3;
/// Complementary products sit within ±30% of the anchor price.
const PRICE_WINDOW: f64 = 0.30;
/// Availability lookahead for service suggestions.
const AVAILABILITY_DAYS: i64 = 7;

#[derive(Debug, Clone, Default)]
pub struct Suggestions {
    pub products: Vec<Product>,
    pub services: Vec<Service>,
}

impl Suggestions {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.services.is_empty()
    }
}

/// Build suggestions from the last-viewed item or customer history.
/// Non-critical: any store error yields empty suggestions.
pub fn build_suggestions(
    reader: &Arc<CatalogReader>,
    tenant_id: &TenantId,
    anchor_product: Option<&Product>,
    history: &CustomerHistory,
) -> Suggestions {
    let mut suggestions = Suggestions::default();

    // Anchor price: last viewed product, else the customer's average order.
    let anchor_cents = anchor_product.map(|p| p.price.cents).or_else(|| {
        let settled = history.total_spent.cents;
        let orders = history.orders.len() as i64;
        (settled > 0 && orders > 0).then(|| settled / orders)
    });

    if let Some(anchor) = anchor_cents {
        let low = (anchor as f64 * (1.0 - PRICE_WINDOW)) as i64;
        let high = (anchor as f64 * (1.0 + PRICE_WINDOW)) as i64;
        let anchor_id = anchor_product.map(|p| p.id.as_str());

        if let Ok(page) = reader.list_products(tenant_id, None, None, 50) {
            let mut seen: HashSet<String> = HashSet::new();
            for product in page.items {
                if Some(product.id.as_str()) == anchor_id {
                    continue;
                }
                if !product.in_stock() {
                    continue;
                }
                if product.price.cents < low || product.price.cents > high {
                    continue;
                }
                if seen.insert(product.id.clone()) {
                    suggestions.products.push(product);
                }
                if suggestions.products.len() >= MAX_SUGGESTED_PRODUCTS {
                    break;
                }
            }
        }
    }

    // Services with open capacity over the next week.
    if let Ok(page) = reader.list_services(tenant_id, None, None, 50) {
        let from = Utc::now().to_rfc3339();
        let to = (Utc::now() + Duration::days(AVAILABILITY_DAYS)).to_rfc3339();
        let mut seen: HashSet<String> = HashSet::new();
        for service in page.items {
            let booked = reader
                .appointments_for_service_between(tenant_id, &service.id, &from, &to)
                .unwrap_or(i64::MAX);
            // Rough weekly capacity from the service duration (8h days).
            let slots_per_day = (8 * 60) / service.duration_minutes.max(1);
            let capacity = slots_per_day * AVAILABILITY_DAYS;
            if booked >= capacity {
                continue;
            }
            if seen.insert(service.id.clone()) {
                suggestions.services.push(service);
            }
            if suggestions.services.len() >= MAX_SUGGESTED_SERVICES {
                break;
            }
        }
    }

    debug!(
        products = suggestions.products.len(),
        services = suggestions.services.len(),
        "suggestions built"
    );
    suggestions
}
