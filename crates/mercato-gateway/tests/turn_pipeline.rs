//! End-to-end pipeline scenarios: burst harmonization, grounding rejection,
//! routing, failover, consent gating and consecutive low-confidence handoff,
//! all driven with a scripted provider and a capturing channel gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::mpsc;

use mercato_agent::{
    ChatMessage, FailoverRunner, HealthTracker, LlmProvider, LlmRequest, LlmResponse,
    ProviderError, ProviderRegistry, Role, RoutingTable,
};
use mercato_catalog::CatalogReader;
use mercato_channels::{ChannelGateway, GatewayError, OutboundPayload, SendReceipt};
use mercato_context::ContextBuilder;
use mercato_conversations::types::{ConversationState, Direction, MessageType};
use mercato_conversations::ConversationStore;
use mercato_core::config::RetrievalConfig;
use mercato_core::money::Money;
use mercato_gateway::orchestrator::Orchestrator;
use mercato_harmonizer::{BurstBuffer, LogicalTurn};
use mercato_knowledge::KnowledgeStore;
use mercato_scheduler::types::ScheduledStatus;
use mercato_scheduler::{Dispatcher, ScheduleStore};
use mercato_tenants::types::TenantLimits;
use mercato_tenants::TenantStore;
use mercato_usage::UsageRecorder;

/// Provider that answers intent-detection requests with a fixed JSON body
/// and pops scripted replies for generation requests.
struct ScriptedProvider {
    name: &'static str,
    intents_json: String,
    replies: Mutex<VecDeque<String>>,
    fail_generation: bool,
}

impl ScriptedProvider {
    fn ok(name: &'static str, intents_json: &str, replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name,
            intents_json: intents_json.to_string(),
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            fail_generation: false,
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            intents_json: String::new(),
            replies: Mutex::new(VecDeque::new()),
            fail_generation: true,
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn generate(&self, req: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        if self.fail_generation {
            return Err(ProviderError::Unavailable("scripted outage".into()));
        }
        let is_intent_call = req
            .messages
            .first()
            .is_some_and(|m| m.content.contains("detects multiple intents"));
        let content = if is_intent_call {
            self.intents_json.clone()
        } else {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap_or_else(|| "Happy to help!".to_string())
            }
        };
        Ok(LlmResponse {
            content,
            finish_reason: "stop".into(),
            input_tokens: 100,
            output_tokens: 30,
            total_tokens: 130,
            estimated_cost: 0.001,
            provider_metadata: serde_json::json!({}),
        })
    }
}

struct CapturingGateway {
    sends: Mutex<Vec<(String, OutboundPayload)>>,
    counter: AtomicU32,
}

impl CapturingGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            counter: AtomicU32::new(0),
        })
    }

    fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelGateway for CapturingGateway {
    async fn send(
        &self,
        _credentials: &serde_json::Value,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendReceipt, GatewayError> {
        self.sends
            .lock()
            .unwrap()
            .push((to.to_string(), payload.clone()));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt {
            provider_message_id: format!("wamid.test.{n}"),
            accepted_status: "accepted".into(),
        })
    }
}

struct Pipeline {
    tenants: Arc<TenantStore>,
    conversations: Arc<ConversationStore>,
    catalog: Arc<CatalogReader>,
    usage: Arc<UsageRecorder>,
    harmonizer: Arc<BurstBuffer>,
    orchestrator: Arc<Orchestrator>,
    gateway: Arc<CapturingGateway>,
    turn_rx: mpsc::Receiver<LogicalTurn>,
    tenant: mercato_tenants::types::Tenant,
}

fn pipeline(providers: Vec<Arc<dyn LlmProvider>>) -> Pipeline {
    let tenants = Arc::new(TenantStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let conversations =
        Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let knowledge =
        Arc::new(KnowledgeStore::new(Connection::open_in_memory().unwrap(), None).unwrap());
    let catalog = Arc::new(CatalogReader::new(Connection::open_in_memory().unwrap()).unwrap());
    let usage = Arc::new(UsageRecorder::new(Connection::open_in_memory().unwrap()).unwrap());

    let (turn_tx, turn_rx) = mpsc::channel(16);
    let harmonizer = BurstBuffer::with_timing(
        Connection::open_in_memory().unwrap(),
        turn_tx,
        0,
        Duration::from_millis(40),
    )
    .unwrap();

    let gateway = CapturingGateway::new();
    let context_builder = Arc::new(ContextBuilder::new(
        Arc::clone(&conversations),
        Arc::clone(&knowledge),
        Arc::clone(&catalog),
        RetrievalConfig::default(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&tenants),
        Arc::clone(&conversations),
        context_builder,
        Arc::new(ProviderRegistry::from_providers(providers)),
        RoutingTable::default(),
        FailoverRunner::with_timeout(HealthTracker::new(), Duration::from_secs(5)),
        Arc::clone(&usage),
        Arc::clone(&harmonizer),
        gateway.clone(),
    ));

    let tenant = tenants
        .create_tenant(
            "Acme Salon",
            "+254700000001",
            vec!["en".into()],
            None,
            TenantLimits::default(),
        )
        .unwrap();

    Pipeline {
        tenants,
        conversations,
        catalog,
        usage,
        harmonizer,
        orchestrator,
        gateway,
        turn_rx,
        tenant,
    }
}

/// Simulate what the webhook does for one inbound message: persist it and
/// buffer it for harmonization.
fn inbound(p: &Pipeline, phone: &str, text: &str) -> mercato_core::types::ConversationId {
    let customer = p.tenants.get_or_create_customer(&p.tenant.id, phone).unwrap();
    let conversation = p
        .conversations
        .get_or_create_active(&p.tenant.id, &customer.id, "whatsapp")
        .unwrap();
    let message = p
        .conversations
        .append_message(
            &conversation.id,
            Direction::In,
            MessageType::CustomerInbound,
            text,
            serde_json::json!({}),
            None,
        )
        .unwrap();
    p.harmonizer
        .enqueue(&p.tenant.id, &conversation.id, message.id.as_str(), text)
        .unwrap();
    conversation.id
}

const BOOKING_INTENTS: &str = r#"{"intents": [
    {"intent": "BOOK_APPOINTMENT", "confidence": 0.93,
     "slots": {"service": "haircut", "time": "tomorrow 10am"},
     "reasoning": "asked to book"}
]}"#;

// S1 — three rapid messages become one turn with one reply.
//
// Short messages route to the simple-query slot (gemini), so the scripted
// provider registers under that name throughout these scenarios.
#[tokio::test]
async fn s1_burst_harmonization() {
    let provider: Arc<dyn LlmProvider> = ScriptedProvider::ok(
        "gemini",
        BOOKING_INTENTS,
        &["Of course! I can book your haircut for tomorrow at 10am."],
    );
    let mut p = pipeline(vec![provider]);

    let conversation_id = inbound(&p, "+254711222333", "I want to book");
    inbound(&p, "+254711222333", "a haircut");
    inbound(&p, "+254711222333", "tomorrow 10am");

    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(turn.message_ids.len(), 3);

    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert!(!report.skipped);
    assert!(report.handoff_reason.is_none());

    // Exactly one outbound reply.
    assert_eq!(p.gateway.sent().len(), 1);

    // The interaction captures all three lines and the booking intent, and
    // its reply text equals the outbound message text.
    let interactions = p
        .usage
        .interactions_for_conversation(&p.tenant.id, &conversation_id);
    assert_eq!(interactions.len(), 1);
    let interaction = &interactions[0];
    for line in ["I want to book", "a haircut", "tomorrow 10am"] {
        assert!(interaction.customer_message.contains(line));
    }
    assert!(interaction
        .detected_intents
        .contains(&"BOOK_APPOINTMENT".to_string()));

    let messages = p.conversations.last_messages(&conversation_id, 10).unwrap();
    let outbound: Vec<_> = messages
        .iter()
        .filter(|m| m.direction == Direction::Out)
        .collect();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].text, interaction.response);
}

// S2 — ungrounded price claims are rejected; a failed regeneration hands off.
#[tokio::test]
async fn s2_grounding_rejection_leads_to_handoff() {
    let provider: Arc<dyn LlmProvider> = ScriptedProvider::ok(
        "gemini",
        r#"{"intents": [{"intent": "PRICE_CHECK", "confidence": 0.9}]}"#,
        &[
            "The Blue Shirt costs $34.99.",
            "The Blue Shirt costs $39.99.",
        ],
    );
    let mut p = pipeline(vec![provider]);
    p.catalog
        .add_product(
            &p.tenant.id,
            "Blue Shirt",
            Some("100% cotton"),
            Money::from_cents(2999),
            "USD",
            5,
            serde_json::json!({}),
        )
        .unwrap();

    let conversation_id = inbound(&p, "+254711222334", "how much is the blue shirt?");
    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert_eq!(report.handoff_reason.as_deref(), Some("grounding_failure"));
    // The hallucinated price never reaches the customer.
    let sends = p.gateway.sent();
    assert_eq!(sends.len(), 1);
    assert!(!sends[0].1.text_body().contains("34.99"));
    assert!(!sends[0].1.text_body().contains("39.99"));

    let conversation = p.conversations.get(&p.tenant.id, &conversation_id).unwrap();
    assert_eq!(conversation.state, ConversationState::HandedOff);
    assert_eq!(
        conversation.metadata["handoff_reason"],
        serde_json::json!("grounding_failure")
    );
}

// S3 — a 120k-token context routes to the large-context model.
#[test]
fn s3_large_context_routing() {
    let table = RoutingTable::default();
    let decision = table.route(
        &[ChatMessage {
            role: Role::User,
            content: "summarise our conversation".into(),
        }],
        Some(120_000),
        None,
    );
    assert_eq!(decision.provider, "gemini");
    assert_eq!(decision.model, "gemini-1.5-pro");
    assert!(decision.reason.starts_with("Large context"));
}

// S4 — primary provider fails, the fallback answers, both calls are ledgered.
#[tokio::test]
async fn s4_failover_records_failed_primary() {
    // Primary slot (gemini) is down; the chain's openai entry answers.
    let primary: Arc<dyn LlmProvider> = ScriptedProvider::failing("gemini");
    let fallback: Arc<dyn LlmProvider> = ScriptedProvider::ok(
        "openai",
        BOOKING_INTENTS,
        &["Gladly - what time suits you?"],
    );
    let mut p = pipeline(vec![primary, fallback]);

    let conversation_id = inbound(&p, "+254711222335", "hi, can you help me book something?");
    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert!(report.reply.is_some());
    assert!(report.handoff_reason.is_none());

    let usage = p.usage.usage_for_tenant(&p.tenant.id);
    let failed_primary = usage
        .iter()
        .find(|u| u.provider == "gemini" && u.model == "gemini-1.5-flash" && !u.success)
        .expect("primary failure ledgered");
    assert!(failed_primary.error.is_some());
    let fallback_success = usage
        .iter()
        .find(|u| u.provider == "openai" && u.success && u.was_failover)
        .expect("failover success ledgered");
    assert_eq!(fallback_success.model, "gpt-4o-mini");

    let conversation = p.conversations.get(&p.tenant.id, &conversation_id).unwrap();
    assert_ne!(conversation.state, ConversationState::HandedOff);
}

// S5 — promotional dispatch without opt-in fails with a consent error and no
// outbound message.
#[tokio::test]
async fn s5_consent_gate_blocks_promotional() {
    let unused: Arc<dyn LlmProvider> = ScriptedProvider::ok("openai", "{}", &[]);
    let p = pipeline(vec![unused]);
    let schedules = Arc::new(ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let customer = p
        .tenants
        .get_or_create_customer(&p.tenant.id, "+254711222336")
        .unwrap();
    let row = schedules
        .insert_row(
            &p.tenant.id,
            Some(&customer.id),
            "Big spring sale!",
            None,
            serde_json::json!({}),
            &chrono::Utc::now().to_rfc3339(),
            "scheduled_promotional",
            serde_json::json!({}),
            serde_json::json!({}),
        )
        .unwrap();

    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&schedules),
            Arc::clone(&p.tenants),
            Arc::clone(&p.conversations),
            p.gateway.clone(),
        )
        .with_timing(Duration::from_millis(10), Duration::from_secs(1)),
    );
    dispatcher.dispatch_due().await.unwrap();

    let reloaded = schedules.get(&row.id).unwrap();
    assert_eq!(reloaded.status, ScheduledStatus::Failed);
    assert!(reloaded.error.as_deref().unwrap().contains("no_consent"));
    assert!(reloaded.message_id.is_none());
    assert!(p.gateway.sent().is_empty());
}

// S6 — two consecutive low-confidence turns hand off and reset the counter.
#[tokio::test]
async fn s6_consecutive_low_confidence_handoff() {
    // No knowledge in context (−0.1) and an uncertainty phrase (−0.2) put
    // confidence at 0.5, under the default 0.7 threshold.
    let provider: Arc<dyn LlmProvider> = ScriptedProvider::ok(
        "gemini",
        r#"{"intents": [{"intent": "OTHER", "confidence": 0.4}]}"#,
        &["I'm not sure I can answer that."],
    );
    let mut p = pipeline(vec![provider]);

    let conversation_id = inbound(&p, "+254711222337", "what about the thing?");
    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert!(report.handoff_reason.is_none());
    assert_eq!(
        p.conversations
            .get(&p.tenant.id, &conversation_id)
            .unwrap()
            .low_confidence_count,
        1
    );

    inbound(&p, "+254711222337", "and the other thing?");
    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert_eq!(
        report.handoff_reason.as_deref(),
        Some("consecutive_low_confidence")
    );

    let conversation = p.conversations.get(&p.tenant.id, &conversation_id).unwrap();
    assert_eq!(conversation.state, ConversationState::HandedOff);
    assert_eq!(conversation.low_confidence_count, 0);
    assert_eq!(
        conversation.metadata["handoff_reason"],
        serde_json::json!("consecutive_low_confidence")
    );

    // A third inbound produces a turn the bot skips entirely.
    inbound(&p, "+254711222337", "hello?");
    let turn = tokio::time::timeout(Duration::from_secs(2), p.turn_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let report = p.orchestrator.process_turn(turn).await.unwrap();
    assert!(report.skipped);
}
