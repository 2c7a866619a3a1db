//! Grounded response validation: every factual claim in a prospective reply
//! must be verifiable against the assembled context, otherwise the reply is
//! rejected and the orchestrator regenerates or hands off.

use tracing::{debug, info, warn};

use mercato_catalog::types::{Product, Service};
use mercato_context::AgentContext;
use mercato_core::money::Money;

use crate::claims::{extract_claims, feature_re, price_re, Claim, ClaimKind};

/// Result of validating one reply.
#[derive(Debug, Clone)]
pub struct GroundingReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

/// Validate a reply against the context. A reply with no claims passes
/// trivially.
pub fn validate_response(response: &str, context: &AgentContext) -> GroundingReport {
    let claims = extract_claims(response);
    if claims.is_empty() {
        debug!("no factual claims found in response");
        return GroundingReport {
            is_valid: true,
            issues: Vec::new(),
        };
    }

    let mut issues = Vec::new();
    for claim in &claims {
        if !verify_claim(claim, context) {
            warn!(claim = %claim.text, "failed to verify claim");
            issues.push(format!("Unverifiable claim: {}", claim.text));
        }
    }

    let is_valid = issues.is_empty();
    if is_valid {
        debug!(claims = claims.len(), "response validation passed");
    } else {
        info!(issues = issues.len(), "response validation failed");
    }
    GroundingReport { is_valid, issues }
}

pub fn verify_claim(claim: &Claim, context: &AgentContext) -> bool {
    match claim.kind {
        ClaimKind::Price => verify_price_claim(&claim.text, context),
        ClaimKind::Availability => verify_availability_claim(&claim.text, context),
        ClaimKind::Existence => verify_existence_claim(&claim.text, context),
        ClaimKind::Feature => verify_feature_claim(&claim.text, context),
    }
}

// ── price ────────────────────────────────────────────────────────────────────

fn verify_price_claim(claim: &str, context: &AgentContext) -> bool {
    let Some(captures) = price_re().captures(claim) else {
        return false;
    };
    let Some(claimed_price) = Money::parse(&captures[1]) else {
        return false;
    };
    let claim_lower = claim.to_lowercase();

    for product in &context.products {
        if product.price.approx_eq(claimed_price) && title_referenced(&product.title, &claim_lower)
        {
            return true;
        }
    }
    for service in &context.services {
        if service.price.approx_eq(claimed_price) && title_referenced(&service.title, &claim_lower)
        {
            return true;
        }
    }
    // Last-viewed items match on price alone; they are what "it" refers to.
    if let Some(product) = &context.last_product_viewed {
        if product.price.approx_eq(claimed_price) {
            return true;
        }
    }
    if let Some(service) = &context.last_service_viewed {
        if service.price.approx_eq(claimed_price) {
            return true;
        }
    }
    false
}

/// Full-title match, or at least half of the title's significant words
/// (length > 1) appear in the claim.
fn title_referenced(title: &str, claim_lower: &str) -> bool {
    let title_lower = title.to_lowercase();
    if claim_lower.contains(&title_lower) {
        return true;
    }
    let words: Vec<&str> = title_lower.split_whitespace().filter(|w| w.len() > 1).collect();
    if words.is_empty() {
        return false;
    }
    let matching = words.iter().filter(|w| claim_lower.contains(*w)).count();
    matching > 0 && matching * 2 >= words.len()
}

// ── availability ─────────────────────────────────────────────────────────────

fn verify_availability_claim(claim: &str, context: &AgentContext) -> bool {
    let claim_lower = claim.to_lowercase();
    let claiming_unavailable = ["out of stock", "unavailable", "not available"]
        .iter()
        .any(|w| claim_lower.contains(w));
    let claiming_available = !claiming_unavailable
        && ["available", "in stock", "have"]
            .iter()
            .any(|w| claim_lower.contains(w));
    if !claiming_available && !claiming_unavailable {
        return false;
    }

    for product in &context.products {
        if product_mentioned(product, &claim_lower) {
            let available = product.in_stock();
            if (claiming_available && available) || (claiming_unavailable && !available) {
                return true;
            }
        }
    }
    for service in &context.services {
        if service_mentioned(service, &claim_lower) && claiming_available && service.active {
            return true;
        }
    }
    if let Some(product) = &context.last_product_viewed {
        if product_mentioned(product, &claim_lower) {
            let available = product.in_stock();
            if (claiming_available && available) || (claiming_unavailable && !available) {
                return true;
            }
        }
    }

    // Generic claim ("we have products available") passes when any catalog
    // item backs it up.
    let generic = !["the", "this", "that"].iter().any(|w| claim_lower.contains(w));
    if generic && claiming_available && !context.products.is_empty() {
        return true;
    }
    false
}

fn product_mentioned(product: &Product, claim_lower: &str) -> bool {
    let title_lower = product.title.to_lowercase();
    if claim_lower.contains(&title_lower) {
        return true;
    }
    title_lower
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .any(|w| claim_lower.contains(w))
}

fn service_mentioned(service: &Service, claim_lower: &str) -> bool {
    service
        .title
        .to_lowercase()
        .split_whitespace()
        .any(|w| claim_lower.contains(w))
}

// ── feature ──────────────────────────────────────────────────────────────────

fn verify_feature_claim(claim: &str, context: &AgentContext) -> bool {
    let Some(captures) = feature_re().captures(claim) else {
        return false;
    };
    let feature_text = captures[1].trim().to_lowercase();

    let check_description = |description: Option<&str>| -> bool {
        let Some(description) = description else {
            return false;
        };
        let desc_lower = description.to_lowercase();
        if desc_lower.contains(&feature_text) || feature_text.contains(desc_lower.trim()) {
            return true;
        }
        let desc_words: Vec<&str> = desc_lower.split_whitespace().filter(|w| w.len() > 1).collect();
        if desc_words.is_empty() {
            return false;
        }
        let matching = desc_words.iter().filter(|w| feature_text.contains(*w)).count();
        matching > 0 && matching * 2 >= desc_words.len()
    };

    for product in &context.products {
        if check_description(product.description.as_deref()) {
            return true;
        }
        if product.metadata.to_string().to_lowercase().contains(&feature_text) {
            return true;
        }
    }
    for service in &context.services {
        if check_description(service.description.as_deref()) {
            return true;
        }
        if service.metadata.to_string().to_lowercase().contains(&feature_text) {
            return true;
        }
    }
    if let Some(product) = &context.last_product_viewed {
        if check_description(product.description.as_deref()) {
            return true;
        }
    }
    if let Some(service) = &context.last_service_viewed {
        if check_description(service.description.as_deref()) {
            return true;
        }
    }
    false
}

// ── existence ────────────────────────────────────────────────────────────────

fn verify_existence_claim(claim: &str, context: &AgentContext) -> bool {
    let claim_lower = claim.to_lowercase();

    for product in &context.products {
        if product_mentioned(product, &claim_lower) {
            return true;
        }
    }
    for service in &context.services {
        let title_lower = service.title.to_lowercase();
        if title_lower
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .any(|w| claim_lower.contains(w))
        {
            return true;
        }
    }

    // Generic claims ("we have products") pass whenever the catalog slice is
    // non-empty.
    let generic_markers = ["products", "services", "items", "offerings"];
    if generic_markers.iter().any(|m| claim_lower.contains(m))
        && (!context.products.is_empty() || !context.services.is_empty())
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_catalog::types::CustomerHistory;
    use mercato_conversations::types::ConversationContext;
    use mercato_core::types::{ConversationId, CustomerId, TenantId};

    fn product(title: &str, cents: i64, stock: i64, description: Option<&str>) -> Product {
        Product {
            id: "p-1".into(),
            tenant_id: TenantId::from("t-1"),
            title: title.to_string(),
            description: description.map(String::from),
            price: Money::from_cents(cents),
            currency: "USD".into(),
            stock,
            metadata: serde_json::json!({}),
            active: true,
            created_at: String::new(),
        }
    }

    fn context_with(products: Vec<Product>, services: Vec<Service>) -> AgentContext {
        AgentContext {
            tenant_id: TenantId::from("t-1"),
            conversation_id: ConversationId::from("conv-1"),
            customer_id: CustomerId::from("c-1"),
            current_message: String::new(),
            history: Vec::new(),
            knowledge: Vec::new(),
            products,
            services,
            customer_history: CustomerHistory::default(),
            conversation_context: ConversationContext {
                conversation_id: ConversationId::from("conv-1"),
                current_topic: None,
                key_facts: Vec::new(),
                summary: None,
                last_product_viewed: None,
                last_service_viewed: None,
                expires_at: "2099-01-01T00:00:00Z".into(),
            },
            last_product_viewed: None,
            last_service_viewed: None,
            rag: None,
            suggestions: None,
            agent_can_do: String::new(),
            agent_cannot_do: String::new(),
            disclaimers: Vec::new(),
            context_size_tokens: 0,
            truncated: false,
        }
    }

    #[test]
    fn correct_price_passes() {
        let ctx = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        let report = validate_response("The Blue Shirt costs $29.99.", &ctx);
        assert!(report.is_valid);
    }

    #[test]
    fn wrong_price_is_rejected() {
        let ctx = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        let report = validate_response("The Blue Shirt costs $34.99.", &ctx);
        assert!(!report.is_valid);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("Unverifiable claim"));
    }

    #[test]
    fn price_tolerates_one_cent() {
        let ctx = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        let report = validate_response("The Blue Shirt costs $30.00.", &ctx);
        assert!(report.is_valid);
    }

    #[test]
    fn price_needs_matching_title() {
        // Right price but a product that is not in context.
        let ctx = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        let report = validate_response("The Galaxy Blender costs $29.99.", &ctx);
        // "Blue" and "Shirt" don't appear, so the title reference fails…
        // …but partial matching needs at least half the title words.
        assert!(!report.is_valid);
    }

    #[test]
    fn availability_matches_stock_semantics() {
        let in_stock = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        assert!(validate_response("The Blue Shirt is in stock.", &in_stock).is_valid);

        let sold_out = context_with(vec![product("Blue Shirt", 2999, 0, None)], Vec::new());
        assert!(validate_response("The Blue Shirt is out of stock.", &sold_out).is_valid);
        assert!(!validate_response("The Blue Shirt is in stock.", &sold_out).is_valid);
    }

    #[test]
    fn feature_verified_against_description() {
        let ctx = context_with(
            vec![product(
                "Blue Shirt",
                2999,
                5,
                Some("100% cotton with a two-year warranty"),
            )],
            Vec::new(),
        );
        assert!(validate_response("The Blue Shirt comes with a two-year warranty.", &ctx).is_valid);
        assert!(!validate_response("The Blue Shirt comes with a lifetime warranty.", &ctx).is_valid);
    }

    #[test]
    fn generic_existence_claim_passes_with_any_product() {
        let ctx = context_with(vec![product("Blue Shirt", 2999, 5, None)], Vec::new());
        assert!(validate_response("We have products for every budget.", &ctx).is_valid);

        let empty = context_with(Vec::new(), Vec::new());
        assert!(!validate_response("We have products for every budget.", &empty).is_valid);
    }

    #[test]
    fn reply_without_claims_passes_trivially() {
        let ctx = context_with(Vec::new(), Vec::new());
        assert!(validate_response("Happy to help! What are you looking for?", &ctx).is_valid);
    }

    #[test]
    fn last_viewed_product_grounds_bare_price() {
        let mut ctx = context_with(Vec::new(), Vec::new());
        ctx.last_product_viewed = Some(product("Blue Shirt", 2999, 5, None));
        assert!(validate_response("It costs $29.99.", &ctx).is_valid);
    }
}
