//! Rich-message opportunity detection. Given the prospective text reply and
//! the turn context, decide whether a card, list or button payload serves
//! the customer better; fall back to plain text on any limit violation.

use tracing::{debug, info};

use mercato_catalog::types::{Product, Service};
use mercato_channels::types::{Button, ListRow, ListSection};
use mercato_channels::OutboundPayload;
use mercato_context::AgentContext;

use crate::limits::ChannelLimits;

const SUGGESTION_KEYWORDS: &[&str] = &["suggest", "recommend", "might like", "consider", "check out"];
const PRODUCT_KEYWORDS: &[&str] = &["product", "item", "buy", "purchase", "price"];
const SERVICE_KEYWORDS: &[&str] = &["service", "appointment", "book", "schedule", "available"];
const YES_NO_PHRASES: &[&str] = &[
    "would you like",
    "do you want",
    "shall i",
    "confirm",
    "proceed",
    "continue",
];

/// What the builder decided for this reply.
#[derive(Debug, Clone)]
pub struct RichOutcome {
    pub payload: OutboundPayload,
    /// Set when a rich opportunity was detected but failed validation.
    pub fallback_reason: Option<String>,
}

/// Build the outbound payload for a reply. Returns plain text when no rich
/// opportunity exists or rich messages are disabled by the caller.
pub fn build_outbound(reply: &str, context: &AgentContext, limits: &ChannelLimits) -> RichOutcome {
    let Some(candidate) = detect_opportunity(reply, context) else {
        return RichOutcome {
            payload: OutboundPayload::Text { body: reply.to_string() },
            fallback_reason: None,
        };
    };

    match limits.validate(&candidate) {
        Ok(()) => {
            info!(kind = payload_kind(&candidate), "rich message built");
            RichOutcome {
                payload: candidate,
                fallback_reason: None,
            }
        }
        Err(violation) => {
            debug!(reason = %violation, "rich message failed validation, falling back to text");
            RichOutcome {
                payload: OutboundPayload::Text { body: reply.to_string() },
                fallback_reason: Some(violation.to_string()),
            }
        }
    }
}

fn payload_kind(payload: &OutboundPayload) -> &'static str {
    match payload {
        OutboundPayload::Text { .. } => "text",
        OutboundPayload::Buttons { .. } => "buttons",
        OutboundPayload::List { .. } => "list",
        OutboundPayload::MediaCard { .. } => "media_card",
    }
}

fn detect_opportunity(reply: &str, context: &AgentContext) -> Option<OutboundPayload> {
    let reply_lower = reply.to_lowercase();

    // Suggestions mentioned in the reply take precedence.
    if let Some(suggestions) = &context.suggestions {
        if SUGGESTION_KEYWORDS.iter().any(|k| reply_lower.contains(k)) {
            if !suggestions.products.is_empty() {
                return Some(products_payload(reply, &suggestions.products));
            }
            if !suggestions.services.is_empty() {
                return Some(services_payload(reply, &suggestions.services));
            }
        }
    }

    // Product talk: card for one item, list for a few.
    if PRODUCT_KEYWORDS.iter().any(|k| reply_lower.contains(k)) {
        if let Some(product) = &context.last_product_viewed {
            return Some(product_card(reply, product));
        }
        match context.products.len() {
            1 => return Some(product_card(reply, &context.products[0])),
            2..=10 => return Some(products_payload(reply, &context.products)),
            _ => {}
        }
    }

    // Service talk mirrors products.
    if SERVICE_KEYWORDS.iter().any(|k| reply_lower.contains(k)) {
        if let Some(service) = &context.last_service_viewed {
            return Some(service_card(reply, service));
        }
        match context.services.len() {
            1 => return Some(service_card(reply, &context.services[0])),
            2..=10 => return Some(services_payload(reply, &context.services)),
            _ => {}
        }
    }

    // A closing yes/no question becomes two buttons.
    if YES_NO_PHRASES.iter().any(|p| reply_lower.contains(p)) {
        return Some(OutboundPayload::Buttons {
            body: reply.to_string(),
            buttons: vec![
                Button {
                    id: "yes".into(),
                    label: "Yes".into(),
                },
                Button {
                    id: "no".into(),
                    label: "No".into(),
                },
            ],
        });
    }

    None
}

fn product_card(reply: &str, product: &Product) -> OutboundPayload {
    OutboundPayload::Buttons {
        body: format!(
            "{}\n\n{} — {} {}{}",
            reply,
            product.title,
            product.currency,
            product.price,
            if product.in_stock() { "" } else { " (out of stock)" },
        ),
        buttons: vec![
            Button {
                id: format!("buy:{}", product.id),
                label: "Buy".into(),
            },
            Button {
                id: format!("details:{}", product.id),
                label: "Details".into(),
            },
        ],
    }
}

fn service_card(reply: &str, service: &Service) -> OutboundPayload {
    OutboundPayload::Buttons {
        body: format!(
            "{}\n\n{} — {} {} ({} min)",
            reply, service.title, service.currency, service.price, service.duration_minutes,
        ),
        buttons: vec![
            Button {
                id: format!("book:{}", service.id),
                label: "Book".into(),
            },
            Button {
                id: format!("slots:{}", service.id),
                label: "Availability".into(),
            },
        ],
    }
}

fn products_payload(reply: &str, products: &[Product]) -> OutboundPayload {
    OutboundPayload::List {
        title: "Products".into(),
        body: reply.to_string(),
        button_label: "Select".into(),
        sections: vec![ListSection {
            title: "Available now".into(),
            rows: products
                .iter()
                .take(10)
                .map(|p| ListRow {
                    id: p.id.clone(),
                    title: truncate_chars(&p.title, 24),
                    description: Some(format!("{} {}", p.currency, p.price)),
                })
                .collect(),
        }],
    }
}

fn services_payload(reply: &str, services: &[Service]) -> OutboundPayload {
    OutboundPayload::List {
        title: "Services".into(),
        body: reply.to_string(),
        button_label: "Select".into(),
        sections: vec![ListSection {
            title: "Book a slot".into(),
            rows: services
                .iter()
                .take(10)
                .map(|s| ListRow {
                    id: s.id.clone(),
                    title: truncate_chars(&s.title, 24),
                    description: Some(format!("{} {}", s.currency, s.price)),
                })
                .collect(),
        }],
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_catalog::types::CustomerHistory;
    use mercato_conversations::types::ConversationContext;
    use mercato_core::money::Money;
    use mercato_core::types::{ConversationId, CustomerId, TenantId};

    fn product(title: &str) -> Product {
        Product {
            id: "p-1".into(),
            tenant_id: TenantId::from("t-1"),
            title: title.to_string(),
            description: None,
            price: Money::from_cents(2999),
            currency: "USD".into(),
            stock: 5,
            metadata: serde_json::json!({}),
            active: true,
            created_at: String::new(),
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            tenant_id: TenantId::from("t-1"),
            conversation_id: ConversationId::from("conv-1"),
            customer_id: CustomerId::from("c-1"),
            current_message: String::new(),
            history: Vec::new(),
            knowledge: Vec::new(),
            products: Vec::new(),
            services: Vec::new(),
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
    fn plain_reply_stays_text() {
        let outcome = build_outbound("Thanks for reaching out!", &context(), &ChannelLimits::default());
        assert!(matches!(outcome.payload, OutboundPayload::Text { .. }));
        assert!(outcome.fallback_reason.is_none());
    }

    #[test]
    fn single_product_becomes_card() {
        let mut ctx = context();
        ctx.products = vec![product("Blue Shirt")];
        let outcome = build_outbound(
            "The price is USD 29.99.",
            &ctx,
            &ChannelLimits::default(),
        );
        match outcome.payload {
            OutboundPayload::Buttons { buttons, .. } => {
                assert_eq!(buttons.len(), 2);
                assert!(buttons[0].id.starts_with("buy:"));
            }
            other => panic!("expected buttons, got {other:?}"),
        }
    }

    #[test]
    fn several_products_become_list() {
        let mut ctx = context();
        ctx.products = (0..4)
            .map(|i| {
                let mut p = product(&format!("Shirt {i}"));
                p.id = format!("p-{i}");
                p
            })
            .collect();
        let outcome = build_outbound("Here are our products.", &ctx, &ChannelLimits::default());
        match outcome.payload {
            OutboundPayload::List { sections, .. } => {
                assert_eq!(sections[0].rows.len(), 4);
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn yes_no_question_becomes_two_buttons() {
        let outcome = build_outbound(
            "Would you like to proceed with the booking?",
            &context(),
            &ChannelLimits::default(),
        );
        match outcome.payload {
            OutboundPayload::Buttons { buttons, .. } => {
                assert_eq!(buttons.len(), 2);
                assert_eq!(buttons[0].label, "Yes");
            }
            other => panic!("expected buttons, got {other:?}"),
        }
    }

    #[test]
    fn limit_violation_falls_back_to_text_with_reason() {
        let mut ctx = context();
        ctx.products = vec![product("Blue Shirt")];
        let strict = ChannelLimits {
            max_buttons: 1,
            ..Default::default()
        };
        let outcome = build_outbound("The price is USD 29.99.", &ctx, &strict);
        assert!(matches!(outcome.payload, OutboundPayload::Text { .. }));
        assert!(outcome.fallback_reason.is_some());
    }
}
