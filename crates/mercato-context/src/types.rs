use mercato_catalog::types::{CustomerHistory, Product, Service};
use mercato_conversations::types::{ConversationContext, Message};
use mercato_core::types::{ConversationId, CustomerId, TenantId};
use mercato_knowledge::types::ScoredEntry;

use crate::rag::RagOutcome;
use crate::suggestions::Suggestions;

/// Everything the agent knows for one turn.
///
/// This is a transient value, rebuilt from ids each turn; it is never
/// persisted. Cross-entity references stay ids and are resolved through the
/// stores on demand.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub customer_id: CustomerId,

    pub current_message: String,
    /// Chronological recent history.
    pub history: Vec<Message>,
    pub knowledge: Vec<ScoredEntry>,
    pub products: Vec<Product>,
    pub services: Vec<Service>,
    pub customer_history: CustomerHistory,

    /// Persistent soft memory (summary, key facts, last referenced items).
    pub conversation_context: ConversationContext,
    /// Last referenced items resolved from ids to live catalog rows.
    pub last_product_viewed: Option<Product>,
    pub last_service_viewed: Option<Service>,

    pub rag: Option<RagOutcome>,
    pub suggestions: Option<Suggestions>,

    /// Never-truncated persona facts carried verbatim into the prompt.
    pub agent_can_do: String,
    pub agent_cannot_do: String,
    pub disclaimers: Vec<String>,

    pub context_size_tokens: usize,
    pub truncated: bool,
}

impl AgentContext {
    /// Estimate the prompt cost of this context: ceil(chars / 4).
    pub fn estimate_tokens(&self) -> usize {
        let mut chars = self.current_message.len();

        for message in &self.history {
            chars += message.text.len();
        }
        for scored in &self.knowledge {
            chars += scored.entry.title.len() + scored.entry.content.len();
        }
        for product in &self.products {
            chars += product.title.len();
            chars += product.description.as_deref().map(str::len).unwrap_or(0);
        }
        for service in &self.services {
            chars += service.title.len();
            chars += service.description.as_deref().map(str::len).unwrap_or(0);
        }
        for order in &self.customer_history.orders {
            chars += order.id.len() + order.status.len() + 16;
        }
        for appointment in &self.customer_history.appointments {
            chars += appointment.service_id.len() + appointment.scheduled_at.len();
        }
        if let Some(summary) = &self.conversation_context.summary {
            chars += summary.len();
        }
        for fact in &self.conversation_context.key_facts {
            chars += fact.len();
        }
        if let Some(rag) = &self.rag {
            for passage in rag.all_passages() {
                chars += passage.title.len() + passage.content.len();
            }
        }
        chars += self.agent_can_do.len() + self.agent_cannot_do.len();
        for disclaimer in &self.disclaimers {
            chars += disclaimer.len();
        }

        chars.div_ceil(4)
    }
}
