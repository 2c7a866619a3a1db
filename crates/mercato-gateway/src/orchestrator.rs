//! The turn pipeline: harmonized turn → context → intents → routed LLM call
//! with failover → grounding validation → handoff policy → rich payload →
//! usage records → outbound emission.
//!
//! Per-conversation execution is serialised by an exclusive async lock held
//! for the whole turn; a turn that exceeds the end-to-end budget is aborted,
//! audited with a timeout reason and handed off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use mercato_agent::confidence::score_confidence;
use mercato_agent::intent::{detect_intents, Intent, IntentCues};
use mercato_agent::language::detect_language;
use mercato_agent::prompt::{build_system_prompt, build_user_prompt};
use mercato_agent::{
    ChatMessage, FailoverRunner, LlmRequest, ProviderRegistry, Role, RoutingTable,
};
use mercato_channels::{ChannelGateway, OutboundPayload};
use mercato_context::{AgentContext, ContextBuilder};
use mercato_conversations::types::{ConversationState, Direction, MessageType};
use mercato_conversations::ConversationStore;
use mercato_core::config::TURN_BUDGET_SECS;
use mercato_guard::{evaluate_handoff, validate_response, HandoffDecision};
use mercato_harmonizer::{BurstBuffer, LogicalTurn};
use mercato_rich::{build_outbound, ChannelLimits};
use mercato_tenants::TenantStore;
use mercato_usage::recorder::new_row_id;
use mercato_usage::{AgentInteraction, ProviderUsage, ReplyShape, UsageRecorder};

/// Fallback text emitted when the pipeline cannot produce a grounded reply.
const FALLBACK_REPLY: &str =
    "I'm having trouble answering that right now. Let me connect you with a member of our team.";

/// What a completed turn produced; returned for tests and logging.
#[derive(Debug)]
pub struct TurnReport {
    pub reply: Option<String>,
    pub handoff_reason: Option<String>,
    pub skipped: bool,
}

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error("store error: {0}")]
    Store(String),

    #[error("all providers failed: {0}")]
    Providers(String),
}

pub struct Orchestrator {
    tenants: Arc<TenantStore>,
    conversations: Arc<ConversationStore>,
    context_builder: Arc<ContextBuilder>,
    registry: Arc<ProviderRegistry>,
    routing: RoutingTable,
    failover: FailoverRunner,
    usage: Arc<UsageRecorder>,
    harmonizer: Arc<BurstBuffer>,
    gateway: Arc<dyn ChannelGateway>,
    limits: ChannelLimits,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    turn_budget: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<TenantStore>,
        conversations: Arc<ConversationStore>,
        context_builder: Arc<ContextBuilder>,
        registry: Arc<ProviderRegistry>,
        routing: RoutingTable,
        failover: FailoverRunner,
        usage: Arc<UsageRecorder>,
        harmonizer: Arc<BurstBuffer>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            tenants,
            conversations,
            context_builder,
            registry,
            routing,
            failover,
            usage,
            harmonizer,
            gateway,
            limits: ChannelLimits::default(),
            locks: DashMap::new(),
            turn_budget: Duration::from_secs(TURN_BUDGET_SECS),
        }
    }

    pub fn with_turn_budget(mut self, budget: Duration) -> Self {
        self.turn_budget = budget;
        self
    }

    /// Run one harmonized turn end to end. Ordered appends and single bot
    /// replies are guaranteed by the per-conversation lock.
    pub async fn process_turn(&self, turn: LogicalTurn) -> anyhow::Result<TurnReport> {
        let lock = self
            .locks
            .entry(turn.conversation_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let started = Instant::now();
        match tokio::time::timeout(self.turn_budget, self.run_turn(&turn, started)).await {
            Ok(Ok(report)) => {
                self.harmonizer.mark_processed(&turn.entry_ids).ok();
                Ok(report)
            }
            Ok(Err(e)) => {
                warn!(conversation_id = %turn.conversation_id, error = %e, "turn failed");
                let report = self
                    .abort_turn(&turn, started, &e.to_string())
                    .await;
                self.harmonizer
                    .mark_failed(&turn.entry_ids, &e.to_string())
                    .ok();
                Ok(report)
            }
            Err(_) => {
                warn!(conversation_id = %turn.conversation_id, "turn exceeded end-to-end budget");
                let reason = format!("turn budget of {}s exceeded", self.turn_budget.as_secs());
                let report = self.abort_turn(&turn, started, &reason).await;
                self.harmonizer.mark_failed(&turn.entry_ids, &reason).ok();
                Ok(report)
            }
        }
    }

    async fn run_turn(
        &self,
        turn: &LogicalTurn,
        started: Instant,
    ) -> Result<TurnReport, TurnError> {
        let conversation = self
            .conversations
            .get(&turn.tenant_id, &turn.conversation_id)
            .map_err(store_err)?;

        // Handoff halts bot replies; closed/dormant conversations reopen on
        // inbound but that is the webhook's job, not this turn's.
        if matches!(
            conversation.state,
            ConversationState::HandedOff | ConversationState::Closed
        ) {
            info!(conversation_id = %turn.conversation_id, state = %conversation.state, "skipping bot reply");
            return Ok(TurnReport {
                reply: None,
                handoff_reason: None,
                skipped: true,
            });
        }

        let tenant = self.tenants.get_tenant(&turn.tenant_id).map_err(store_err)?;
        let settings = self
            .tenants
            .get_settings(&turn.tenant_id)
            .map_err(store_err)?
            .settings;
        let customer = self
            .tenants
            .get_customer(&turn.tenant_id, &conversation.customer_id)
            .map_err(store_err)?;

        let context = self
            .context_builder
            .build(
                &turn.tenant_id,
                &turn.conversation_id,
                &conversation.customer_id,
                &turn.combined_text,
                &settings,
            )
            .await
            .map_err(store_err)?;

        // Route by the request shape: history + the current turn.
        let mut routing_messages: Vec<ChatMessage> = context
            .history
            .iter()
            .map(|m| ChatMessage {
                role: match m.direction {
                    Direction::In => Role::User,
                    Direction::Out => Role::Assistant,
                },
                content: m.text.clone(),
            })
            .collect();
        routing_messages.push(ChatMessage {
            role: Role::User,
            content: turn.combined_text.clone(),
        });
        let decision =
            self.routing
                .route(&routing_messages, Some(context.context_size_tokens), None);
        info!(
            provider = %decision.provider,
            model = %decision.model,
            reason = %decision.reason,
            complexity = decision.complexity_score,
            "model routed"
        );

        let registry = self.registry.for_tenant(&tenant.channel_credentials);
        let intents = self
            .detect_turn_intents(&registry, &decision.model, &decision.provider, turn, &context)
            .await;
        if let Some(top) = intents.first() {
            self.conversations
                .record_intent(&turn.conversation_id, &top.name, top.confidence)
                .ok();
        }

        let language = detect_language(&turn.combined_text, &tenant.allowed_languages);
        let top_category = intents.first().map(|i| i.category);
        let system_prompt = build_system_prompt(&settings, top_category, &language);
        let user_prompt = build_user_prompt(&context, &intents);

        let max_tokens = (settings.max_response_length / 4).clamp(128, 2048);
        let request = LlmRequest {
            model: decision.model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: system_prompt.clone(),
                },
                ChatMessage {
                    role: Role::User,
                    content: user_prompt.clone(),
                },
            ],
            temperature: settings.temperature,
            max_tokens,
        };

        // Primary generation with failover across the tenant's chain.
        let outcome = self
            .failover
            .execute(
                &registry,
                (decision.provider.as_str(), decision.model.as_str()),
                &settings.fallback_models,
                &request,
            )
            .await
            .map_err(|e| {
                // A fully failed run still leaves its ledger rows.
                self.record_attempts(
                    &turn.tenant_id,
                    &e.attempts,
                    &decision.reason,
                    decision.complexity_score,
                    None,
                );
                TurnError::Providers(e.last_error.clone())
            })?;
        self.record_attempts(&turn.tenant_id, &outcome.attempts, &decision.reason, decision.complexity_score, None);

        let mut reply = outcome.response.content.trim().to_string();
        let knowledge_scores: Vec<f32> = context.knowledge.iter().map(|s| s.score).collect();
        let mut confidence = score_confidence(&reply, &knowledge_scores);
        let mut grounding_handoff = false;

        // Grounding gate: regenerate once, then hand off.
        let report = validate_response(&reply, &context);
        if !report.is_valid {
            info!(issues = report.issues.len(), "reply failed grounding, regenerating once");
            let mut retry_request = request.clone();
            retry_request.messages[0].content = format!(
                "{system_prompt}\n\nYour previous draft contained unverifiable claims:\n{}\n\
                 State ONLY facts present in the provided context.",
                report.issues.join("\n"),
            );
            match self
                .failover
                .execute(
                    &registry,
                    (outcome.provider.as_str(), outcome.model.as_str()),
                    &settings.fallback_models,
                    &retry_request,
                )
                .await
            {
                Ok(retry_outcome) => {
                    self.record_attempts(
                        &turn.tenant_id,
                        &retry_outcome.attempts,
                        &decision.reason,
                        decision.complexity_score,
                        None,
                    );
                    let retry_reply = retry_outcome.response.content.trim().to_string();
                    let retry_report = validate_response(&retry_reply, &context);
                    if retry_report.is_valid {
                        reply = retry_reply;
                        confidence = score_confidence(&reply, &knowledge_scores);
                    } else {
                        grounding_handoff = true;
                        reply = FALLBACK_REPLY.to_string();
                        confidence = 0.0;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "regeneration failed");
                    grounding_handoff = true;
                    reply = FALLBACK_REPLY.to_string();
                    confidence = 0.0;
                }
            }
        }

        // Handoff policy. Grounding failure wins; otherwise the ordered rules.
        let mut handoff_reason: Option<String> = None;
        if grounding_handoff {
            handoff_reason = Some("grounding_failure".to_string());
        } else {
            match evaluate_handoff(
                &reply,
                confidence,
                conversation.low_confidence_count,
                Some(&turn.combined_text),
                &settings,
            ) {
                HandoffDecision::Handoff { reason } => handoff_reason = Some(reason),
                HandoffDecision::IncrementLowConfidence => {
                    self.conversations
                        .increment_low_confidence(&turn.conversation_id)
                        .map_err(store_err)?;
                }
                HandoffDecision::Continue => {
                    self.conversations
                        .reset_low_confidence(&turn.conversation_id)
                        .map_err(store_err)?;
                }
            }
        }

        // Source attribution is a non-critical decoration on grounded replies.
        if settings.enable_source_attribution && !grounding_handoff {
            if let Some(rag) = &context.rag {
                if !rag.manifest.is_empty() {
                    let mut sources: Vec<&str> =
                        rag.manifest.iter().map(|s| s.title.as_str()).collect();
                    sources.dedup();
                    reply.push_str(&format!("\n\nSources: {}", sources.join(", ")));
                }
            }
        }

        // Rich payload. Disabled tenants and handoff turns stay plain text.
        let payload = if settings.enable_rich_messages && handoff_reason.is_none() {
            build_outbound(&reply, &context, &self.limits).payload
        } else {
            OutboundPayload::Text { body: reply.clone() }
        };
        let final_text = payload.text_body().to_string();
        let reply_shape = match &payload {
            OutboundPayload::Text { .. } => ReplyShape::Text,
            OutboundPayload::Buttons { .. } => ReplyShape::Button,
            OutboundPayload::List { .. } => ReplyShape::List,
            OutboundPayload::MediaCard { .. } => ReplyShape::Media,
        };

        self.remember_referenced_items(&context, &intents);

        // Emit the outbound message, then settle delivery state.
        let message = self
            .conversations
            .append_message(
                &turn.conversation_id,
                Direction::Out,
                MessageType::BotResponse,
                &final_text,
                serde_json::to_value(&payload).unwrap_or(serde_json::json!({})),
                None,
            )
            .map_err(store_err)?;
        match self
            .gateway
            .send(&tenant.channel_credentials, &customer.phone, &payload)
            .await
        {
            Ok(receipt) => {
                self.conversations
                    .mark_sent(&message.id, Some(&receipt.provider_message_id))
                    .ok();
            }
            Err(e) => {
                warn!(error = %e, "outbound send failed");
                self.conversations.mark_failed(&message.id, &e.to_string()).ok();
            }
        }

        // Audit trail: one interaction per turn, best-effort.
        self.usage.record_interaction(&AgentInteraction {
            id: new_row_id(),
            tenant_id: turn.tenant_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            customer_message: turn.combined_text.clone(),
            detected_intents: intents.iter().map(|i| i.name.clone()).collect(),
            model_used: outcome.model.clone(),
            context_tokens: context.context_size_tokens as u32,
            processing_time_ms: started.elapsed().as_millis() as u64,
            response: final_text.clone(),
            confidence_score: confidence,
            handoff_triggered: handoff_reason.is_some(),
            handoff_reason: handoff_reason.clone(),
            reply_shape,
            prompt_tokens: outcome.response.input_tokens,
            completion_tokens: outcome.response.output_tokens,
            total_tokens: outcome.response.total_tokens,
            estimated_cost: outcome.response.estimated_cost,
            created_at: Utc::now().to_rfc3339(),
        });

        if let Some(reason) = &handoff_reason {
            self.conversations
                .transition_state(
                    &turn.tenant_id,
                    &turn.conversation_id,
                    ConversationState::HandedOff,
                    Some(reason),
                    None,
                )
                .map_err(store_err)?;
        } else if conversation.state == ConversationState::Open {
            self.conversations
                .transition_state(
                    &turn.tenant_id,
                    &turn.conversation_id,
                    ConversationState::BotHandled,
                    None,
                    None,
                )
                .ok();
        }

        Ok(TurnReport {
            reply: Some(final_text),
            handoff_reason,
            skipped: false,
        })
    }

    /// Intent detection is semi-critical: a provider failure logs, records
    /// the usage row and yields an empty intent list.
    async fn detect_turn_intents(
        &self,
        registry: &ProviderRegistry,
        model: &str,
        provider_name: &str,
        turn: &LogicalTurn,
        context: &AgentContext,
    ) -> Vec<Intent> {
        let Some(provider) = registry.get(provider_name) else {
            warn!(provider = provider_name, "intent provider not configured");
            return Vec::new();
        };

        let cues = IntentCues {
            recent_turns: context
                .history
                .iter()
                .map(|m| (m.direction == Direction::In, m.text.clone()))
                .collect(),
            last_product_viewed: context.last_product_viewed.as_ref().map(|p| p.title.clone()),
            last_service_viewed: context.last_service_viewed.as_ref().map(|s| s.title.clone()),
        };

        let started = Instant::now();
        match detect_intents(provider.as_ref(), model, &turn.combined_text, &cues).await {
            Ok(intents) => {
                self.usage.record_provider_usage(&ProviderUsage {
                    id: new_row_id(),
                    tenant_id: turn.tenant_id.clone(),
                    provider: provider_name.to_string(),
                    model: model.to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    total_tokens: 0,
                    estimated_cost: 0.0,
                    latency_ms: started.elapsed().as_millis() as u64,
                    success: true,
                    finish_reason: Some("intent_detection".into()),
                    was_failover: false,
                    routing_reason: None,
                    complexity_score: None,
                    interaction_id: None,
                    error: None,
                    created_at: Utc::now().to_rfc3339(),
                });
                intents
            }
            Err(e) => {
                warn!(error = %e, "intent detection failed, continuing without intents");
                self.usage.record_provider_usage(&ProviderUsage {
                    id: new_row_id(),
                    tenant_id: turn.tenant_id.clone(),
                    provider: provider_name.to_string(),
                    model: model.to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    total_tokens: 0,
                    estimated_cost: 0.0,
                    latency_ms: started.elapsed().as_millis() as u64,
                    success: false,
                    finish_reason: None,
                    was_failover: false,
                    routing_reason: None,
                    complexity_score: None,
                    interaction_id: None,
                    error: Some(e.to_string()),
                    created_at: Utc::now().to_rfc3339(),
                });
                Vec::new()
            }
        }
    }

    fn record_attempts(
        &self,
        tenant_id: &mercato_core::types::TenantId,
        attempts: &[mercato_agent::AttemptRecord],
        routing_reason: &str,
        complexity: f64,
        interaction_id: Option<&str>,
    ) {
        for attempt in attempts {
            let (input, output, total) = attempt.response_tokens.unwrap_or((0, 0, 0));
            self.usage.record_provider_usage(&ProviderUsage {
                id: new_row_id(),
                tenant_id: tenant_id.clone(),
                provider: attempt.provider.clone(),
                model: attempt.model.clone(),
                input_tokens: input,
                output_tokens: output,
                total_tokens: total,
                estimated_cost: attempt.estimated_cost,
                latency_ms: attempt.latency_ms,
                success: attempt.success,
                finish_reason: attempt.success.then(|| "stop".to_string()),
                was_failover: attempt.was_failover,
                routing_reason: Some(routing_reason.to_string()),
                complexity_score: Some(complexity),
                interaction_id: interaction_id.map(String::from),
                error: attempt.error.clone(),
                created_at: Utc::now().to_rfc3339(),
            });
        }
    }

    /// Keep the soft memory pointing at what the customer is looking at.
    fn remember_referenced_items(&self, context: &AgentContext, intents: &[Intent]) {
        let mut soft = context.conversation_context.clone();
        let mut dirty = false;
        if context.products.len() == 1 {
            soft.last_product_viewed = Some(context.products[0].id.clone());
            dirty = true;
        }
        if context.services.len() == 1 {
            soft.last_service_viewed = Some(context.services[0].id.clone());
            dirty = true;
        }
        if let Some(top) = intents.first() {
            soft.current_topic = Some(top.name.clone());
            dirty = true;
        }
        if dirty {
            self.conversations.update_context(&soft).ok();
        }
    }

    /// Turn-level failure handler: emit a fallback reply, write the partial
    /// interaction with the failure reason and hand the conversation off.
    async fn abort_turn(&self, turn: &LogicalTurn, started: Instant, reason: &str) -> TurnReport {
        let final_text = FALLBACK_REPLY.to_string();

        if let (Ok(tenant), Ok(conversation)) = (
            self.tenants.get_tenant(&turn.tenant_id),
            self.conversations.get(&turn.tenant_id, &turn.conversation_id),
        ) {
            if let Ok(customer) = self
                .tenants
                .get_customer(&turn.tenant_id, &conversation.customer_id)
            {
                if let Ok(message) = self.conversations.append_message(
                    &turn.conversation_id,
                    Direction::Out,
                    MessageType::BotResponse,
                    &final_text,
                    serde_json::json!({}),
                    None,
                ) {
                    let payload = OutboundPayload::Text {
                        body: final_text.clone(),
                    };
                    match self
                        .gateway
                        .send(&tenant.channel_credentials, &customer.phone, &payload)
                        .await
                    {
                        Ok(receipt) => {
                            self.conversations
                                .mark_sent(&message.id, Some(&receipt.provider_message_id))
                                .ok();
                        }
                        Err(e) => {
                            self.conversations.mark_failed(&message.id, &e.to_string()).ok();
                        }
                    }
                }
            }
        }

        self.usage.record_interaction(&AgentInteraction {
            id: new_row_id(),
            tenant_id: turn.tenant_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            customer_message: turn.combined_text.clone(),
            detected_intents: Vec::new(),
            model_used: "unavailable".into(),
            context_tokens: 0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            response: final_text.clone(),
            confidence_score: 0.0,
            handoff_triggered: true,
            handoff_reason: Some(format!("processing_error: {reason}")),
            reply_shape: ReplyShape::Text,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            estimated_cost: 0.0,
            created_at: Utc::now().to_rfc3339(),
        });

        self.conversations
            .transition_state(
                &turn.tenant_id,
                &turn.conversation_id,
                ConversationState::HandedOff,
                Some("processing_error"),
                None,
            )
            .ok();

        TurnReport {
            reply: Some(final_text),
            handoff_reason: Some("processing_error".to_string()),
            skipped: false,
        }
    }
}

fn store_err(e: impl std::fmt::Display) -> TurnError {
    TurnError::Store(e.to_string())
}
