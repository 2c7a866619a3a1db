//! Assembles the bounded [`AgentContext`] for one turn from the stores, the
//! persistent conversation context, retrieval and suggestions.

use std::sync::Arc;

use tracing::{debug, info, warn};

use mercato_catalog::CatalogReader;
use mercato_conversations::ConversationStore;
use mercato_core::config::{RetrievalConfig, CONTEXT_TOKEN_BUDGET};
use mercato_core::types::{ConversationId, CustomerId, TenantId};
use mercato_knowledge::KnowledgeStore;
use mercato_tenants::settings::AgentSettings;

use crate::error::Result;
use crate::rag::{DatabaseSource, DocumentSource, InternetSource, RagRetriever, RetrievalSource};
use crate::suggestions::build_suggestions;
use crate::types::AgentContext;

/// Assembly limits before the token-budget pass.
const MAX_HISTORY_MESSAGES: usize = 20;
const MAX_KNOWLEDGE_ENTRIES: usize = 5;
const MAX_CATALOG_ITEMS: usize = 10;
const MAX_HISTORY_ITEMS: usize = 5;

pub struct ContextBuilder {
    conversations: Arc<ConversationStore>,
    knowledge: Arc<KnowledgeStore>,
    catalog: Arc<CatalogReader>,
    retrieval_config: RetrievalConfig,
    token_budget: usize,
}

impl ContextBuilder {
    pub fn new(
        conversations: Arc<ConversationStore>,
        knowledge: Arc<KnowledgeStore>,
        catalog: Arc<CatalogReader>,
        retrieval_config: RetrievalConfig,
    ) -> Self {
        Self {
            conversations,
            knowledge,
            catalog,
            retrieval_config,
            token_budget: CONTEXT_TOKEN_BUDGET,
        }
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    /// Build the full context for a turn, then apply the token budget.
    pub async fn build(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        customer_id: &CustomerId,
        current_message: &str,
        settings: &AgentSettings,
    ) -> Result<AgentContext> {
        let conversation_context = self.conversations.get_or_create_context(conversation_id)?;

        let history = self
            .conversations
            .last_messages(conversation_id, MAX_HISTORY_MESSAGES)?;

        let knowledge = match self
            .knowledge
            .search(tenant_id, current_message, None, MAX_KNOWLEDGE_ENTRIES, 0.7)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "knowledge retrieval failed, continuing without");
                Vec::new()
            }
        };

        let (products, services) =
            self.catalog
                .catalog_slice(tenant_id, Some(current_message), MAX_CATALOG_ITEMS)?;

        let customer_history =
            self.catalog
                .customer_history(tenant_id, customer_id, MAX_HISTORY_ITEMS)?;

        let last_product_viewed = match &conversation_context.last_product_viewed {
            Some(id) => self.catalog.get_product(tenant_id, id)?,
            None => None,
        };
        let last_service_viewed = match &conversation_context.last_service_viewed {
            Some(id) => self.catalog.get_service(tenant_id, id)?,
            None => None,
        };

        let rag = if settings.enable_document_retrieval
            || settings.enable_database_retrieval
            || settings.enable_internet_retrieval
        {
            let mut sources: Vec<Arc<dyn RetrievalSource>> = vec![
                Arc::new(DatabaseSource::new(
                    tenant_id.clone(),
                    Arc::clone(&self.catalog),
                )),
                Arc::new(DocumentSource::new(
                    tenant_id.clone(),
                    Arc::clone(&self.knowledge),
                )),
            ];
            if let Some(key) = &self.retrieval_config.search_api_key {
                sources.push(Arc::new(InternetSource::new(
                    &self.retrieval_config.search_base_url,
                    key,
                )));
            }
            let outcome = RagRetriever::new(sources)
                .retrieve(current_message, settings)
                .await;
            (!outcome.is_empty()).then_some(outcome)
        } else {
            None
        };

        let suggestions = if settings.enable_proactive_suggestions {
            let built = build_suggestions(
                &self.catalog,
                tenant_id,
                last_product_viewed.as_ref(),
                &customer_history,
            );
            (!built.is_empty()).then_some(built)
        } else {
            None
        };

        let mut context = AgentContext {
            tenant_id: tenant_id.clone(),
            conversation_id: conversation_id.clone(),
            customer_id: customer_id.clone(),
            current_message: current_message.to_string(),
            history,
            knowledge,
            products,
            services,
            customer_history,
            conversation_context,
            last_product_viewed,
            last_service_viewed,
            rag,
            suggestions,
            agent_can_do: settings.agent_can_do.clone(),
            agent_cannot_do: settings.agent_cannot_do.clone(),
            disclaimers: settings.disclaimers.clone(),
            context_size_tokens: 0,
            truncated: false,
        };

        context.context_size_tokens = context.estimate_tokens();
        apply_token_budget(&mut context, self.token_budget);

        info!(
            conversation_id = %conversation_id,
            tokens = context.context_size_tokens,
            truncated = context.truncated,
            history = context.history.len(),
            knowledge = context.knowledge.len(),
            "context assembled"
        );
        Ok(context)
    }
}

/// Shrink the context to the token budget in a fixed priority order,
/// recomputing the estimate after each step. The current message, agent
/// can-do/cannot-do and disclaimers are never touched.
pub fn apply_token_budget(context: &mut AgentContext, budget: usize) {
    if context.estimate_tokens() <= budget {
        context.context_size_tokens = context.estimate_tokens();
        context.truncated = false;
        return;
    }

    context.truncated = true;

    // 1. History down to the last 5 messages.
    if context.history.len() > 5 {
        let keep_from = context.history.len() - 5;
        context.history.drain(..keep_from);
        debug!("truncated history to last 5 messages");
    }
    if recompute(context) <= budget {
        return;
    }

    // 2. Knowledge down to the top 3.
    if context.knowledge.len() > 3 {
        context.knowledge.truncate(3);
        debug!("truncated knowledge to top 3");
    }
    if recompute(context) <= budget {
        return;
    }

    // 3. Products down to the top 5.
    if context.products.len() > 5 {
        context.products.truncate(5);
        debug!("truncated products to top 5");
    }
    if recompute(context) <= budget {
        return;
    }

    // 4. Services down to the top 5.
    if context.services.len() > 5 {
        context.services.truncate(5);
        debug!("truncated services to top 5");
    }
    if recompute(context) <= budget {
        return;
    }

    // 5. Drop customer order/appointment history entirely.
    context.customer_history = Default::default();
    recompute(context);
}

fn recompute(context: &mut AgentContext) -> usize {
    context.context_size_tokens = context.estimate_tokens();
    context.context_size_tokens
}
