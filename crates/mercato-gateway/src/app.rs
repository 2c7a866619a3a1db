use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::info;

use mercato_agent::{FailoverRunner, HealthTracker, ProviderRegistry, RoutingTable};
use mercato_catalog::CatalogReader;
use mercato_channels::{ChannelGateway, GatewayError, OutboundPayload, SendReceipt};
use mercato_context::ContextBuilder;
use mercato_conversations::ConversationStore;
use mercato_core::config::MercatoConfig;
use mercato_harmonizer::{BurstBuffer, LogicalTurn};
use mercato_knowledge::embedder::HttpEmbedder;
use mercato_knowledge::{Embedder, KnowledgeStore};
use mercato_scheduler::{Dispatcher, ScheduleStore};
use mercato_tenants::TenantStore;
use mercato_usage::UsageRecorder;

use crate::orchestrator::Orchestrator;

/// Development stand-in for the external channel gateway: accepts every
/// payload and fabricates a provider message id. Production deployments
/// inject a real transport.
pub struct LoggingGateway;

#[async_trait]
impl ChannelGateway for LoggingGateway {
    async fn send(
        &self,
        _tenant_credentials: &serde_json::Value,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendReceipt, GatewayError> {
        info!(to, body = payload.text_body(), "outbound message (logging gateway)");
        Ok(SendReceipt {
            provider_message_id: format!("local.{}", uuid::Uuid::new_v4()),
            accepted_status: "accepted".into(),
        })
    }
}

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: MercatoConfig,
    pub tenants: Arc<TenantStore>,
    pub conversations: Arc<ConversationStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub catalog: Arc<CatalogReader>,
    pub schedules: Arc<ScheduleStore>,
    pub usage: Arc<UsageRecorder>,
    pub harmonizer: Arc<BurstBuffer>,
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    /// Rate limiting buckets: key (user or IP) → (window start epoch-min, count).
    pub rate_buckets: DashMap<String, (i64, u32)>,
}

impl AppState {
    pub fn new(
        config: MercatoConfig,
        turn_tx: mpsc::Sender<LogicalTurn>,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let open = || Connection::open(&config.database.path);

        let tenants = Arc::new(TenantStore::new(open()?)?);
        let conversations = Arc::new(ConversationStore::new(open()?)?);
        let embedder: Option<Arc<dyn Embedder>> = HttpEmbedder::from_config(&config.embedding)
            .map(|e| Arc::new(e) as Arc<dyn Embedder>);
        let knowledge = Arc::new(KnowledgeStore::new(open()?, embedder)?);
        let catalog = Arc::new(CatalogReader::new(open()?)?);
        let schedules = Arc::new(ScheduleStore::new(open()?)?);
        let usage = Arc::new(UsageRecorder::new(open()?)?);
        let harmonizer = BurstBuffer::new(open()?, turn_tx)?;

        let gateway: Arc<dyn ChannelGateway> = Arc::new(LoggingGateway);
        let health = HealthTracker::new();
        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        let context_builder = Arc::new(ContextBuilder::new(
            Arc::clone(&conversations),
            Arc::clone(&knowledge),
            Arc::clone(&catalog),
            config.retrieval.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&tenants),
            Arc::clone(&conversations),
            context_builder,
            registry,
            RoutingTable::default(),
            FailoverRunner::new(Arc::clone(&health)),
            Arc::clone(&usage),
            Arc::clone(&harmonizer),
            Arc::clone(&gateway),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&schedules),
            Arc::clone(&tenants),
            Arc::clone(&conversations),
            Arc::clone(&gateway),
        ));

        Ok(Self {
            config,
            tenants,
            conversations,
            knowledge,
            catalog,
            schedules,
            usage,
            harmonizer,
            orchestrator,
            dispatcher,
            rate_buckets: DashMap::new(),
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/webhooks/channel", post(crate::webhook::webhook_handler))
        .route(
            "/v1/conversations",
            get(crate::http::conversations::list_conversations),
        )
        .route(
            "/v1/conversations/{id}",
            get(crate::http::conversations::get_conversation),
        )
        .route(
            "/v1/conversations/{id}/messages",
            get(crate::http::conversations::list_messages),
        )
        .route(
            "/v1/conversations/{id}/handoff",
            post(crate::http::conversations::handoff_conversation),
        )
        .route("/v1/customers", get(crate::http::customers::list_customers))
        .route(
            "/v1/customers/{id}",
            get(crate::http::customers::get_customer),
        )
        .route(
            "/v1/customers/{id}/export",
            post(crate::http::customers::export_customer),
        )
        .route(
            "/v1/settings/api-keys",
            get(crate::http::api_keys::list_api_keys).post(crate::http::api_keys::create_api_key),
        )
        .route(
            "/v1/settings/api-keys/{id}",
            delete(crate::http::api_keys::revoke_api_key),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
