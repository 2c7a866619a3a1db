use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use mercato_core::types::{ConversationId, TenantId};

use crate::db::init_db;
use crate::types::{AgentInteraction, ProviderUsage, ReplyShape};

/// Append-only recorder for interactions and provider calls.
///
/// Writes are best-effort: a failed insert logs a warning and never blocks
/// the outbound emission. Reads are for audit/diagnostics and tests.
pub struct UsageRecorder {
    db: Arc<Mutex<Connection>>,
}

impl UsageRecorder {
    pub fn new(conn: Connection) -> Result<Self, rusqlite::Error> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist a turn record. Returns the interaction id even when the write
    /// failed, so callers can link usage rows regardless.
    pub fn record_interaction(&self, interaction: &AgentInteraction) -> String {
        let result = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO agent_interactions
                 (id, tenant_id, conversation_id, customer_message, detected_intents,
                  model_used, context_tokens, processing_time_ms, response,
                  confidence_score, handoff_triggered, handoff_reason, reply_shape,
                  prompt_tokens, completion_tokens, total_tokens, estimated_cost, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                rusqlite::params![
                    interaction.id,
                    interaction.tenant_id.as_str(),
                    interaction.conversation_id.as_str(),
                    interaction.customer_message,
                    serde_json::to_string(&interaction.detected_intents).unwrap_or_default(),
                    interaction.model_used,
                    interaction.context_tokens,
                    interaction.processing_time_ms as i64,
                    interaction.response,
                    interaction.confidence_score,
                    interaction.handoff_triggered as i64,
                    interaction.handoff_reason,
                    interaction.reply_shape.as_str(),
                    interaction.prompt_tokens,
                    interaction.completion_tokens,
                    interaction.total_tokens,
                    interaction.estimated_cost,
                    interaction.created_at,
                ],
            )
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to record agent interaction");
        } else {
            debug!(interaction_id = %interaction.id, "interaction recorded");
        }
        interaction.id.clone()
    }

    /// Persist one provider-call ledger row (failures included).
    pub fn record_provider_usage(&self, usage: &ProviderUsage) {
        let result = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO provider_usage
                 (id, tenant_id, provider, model, input_tokens, output_tokens, total_tokens,
                  estimated_cost, latency_ms, success, finish_reason, was_failover,
                  routing_reason, complexity_score, interaction_id, error, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                rusqlite::params![
                    usage.id,
                    usage.tenant_id.as_str(),
                    usage.provider,
                    usage.model,
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.total_tokens,
                    usage.estimated_cost,
                    usage.latency_ms as i64,
                    usage.success as i64,
                    usage.finish_reason,
                    usage.was_failover as i64,
                    usage.routing_reason,
                    usage.complexity_score,
                    usage.interaction_id,
                    usage.error,
                    usage.created_at,
                ],
            )
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to record provider usage");
        }
    }

    pub fn interactions_for_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Vec<AgentInteraction> {
        let db = self.db.lock().unwrap();
        let Ok(mut stmt) = db.prepare(
            "SELECT id, tenant_id, conversation_id, customer_message, detected_intents,
                    model_used, context_tokens, processing_time_ms, response,
                    confidence_score, handoff_triggered, handoff_reason, reply_shape,
                    prompt_tokens, completion_tokens, total_tokens, estimated_cost, created_at
             FROM agent_interactions
             WHERE tenant_id = ?1 AND conversation_id = ?2
             ORDER BY created_at",
        ) else {
            return Vec::new();
        };
        stmt.query_map(
            rusqlite::params![tenant_id.as_str(), conversation_id.as_str()],
            row_to_interaction,
        )
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    pub fn usage_for_tenant(&self, tenant_id: &TenantId) -> Vec<ProviderUsage> {
        let db = self.db.lock().unwrap();
        let Ok(mut stmt) = db.prepare(
            "SELECT id, tenant_id, provider, model, input_tokens, output_tokens, total_tokens,
                    estimated_cost, latency_ms, success, finish_reason, was_failover,
                    routing_reason, complexity_score, interaction_id, error, created_at
             FROM provider_usage WHERE tenant_id = ?1 ORDER BY created_at",
        ) else {
            return Vec::new();
        };
        stmt.query_map([tenant_id.as_str()], row_to_usage)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }
}

/// Convenience id for new rows.
pub fn new_row_id() -> String {
    Uuid::now_v7().to_string()
}

fn row_to_interaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentInteraction> {
    let intents: String = row.get(4)?;
    let shape: String = row.get(12)?;
    Ok(AgentInteraction {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        conversation_id: ConversationId::from(row.get::<_, String>(2)?),
        customer_message: row.get(3)?,
        detected_intents: serde_json::from_str(&intents).unwrap_or_default(),
        model_used: row.get(5)?,
        context_tokens: row.get(6)?,
        processing_time_ms: row.get::<_, i64>(7)? as u64,
        response: row.get(8)?,
        confidence_score: row.get(9)?,
        handoff_triggered: row.get::<_, i64>(10)? != 0,
        handoff_reason: row.get(11)?,
        reply_shape: shape.parse().unwrap_or(ReplyShape::Text),
        prompt_tokens: row.get(13)?,
        completion_tokens: row.get(14)?,
        total_tokens: row.get(15)?,
        estimated_cost: row.get(16)?,
        created_at: row.get(17)?,
    })
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderUsage> {
    Ok(ProviderUsage {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        provider: row.get(2)?,
        model: row.get(3)?,
        input_tokens: row.get(4)?,
        output_tokens: row.get(5)?,
        total_tokens: row.get(6)?,
        estimated_cost: row.get(7)?,
        latency_ms: row.get::<_, i64>(8)? as u64,
        success: row.get::<_, i64>(9)? != 0,
        finish_reason: row.get(10)?,
        was_failover: row.get::<_, i64>(11)? != 0,
        routing_reason: row.get(12)?,
        complexity_score: row.get(13)?,
        interaction_id: row.get(14)?,
        error: row.get(15)?,
        created_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> UsageRecorder {
        UsageRecorder::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn interaction(tenant: &TenantId, conversation: &ConversationId) -> AgentInteraction {
        AgentInteraction {
            id: new_row_id(),
            tenant_id: tenant.clone(),
            conversation_id: conversation.clone(),
            customer_message: "how much is the shirt?".into(),
            detected_intents: vec!["PRICE_CHECK".into()],
            model_used: "gpt-4o".into(),
            context_tokens: 1200,
            processing_time_ms: 850,
            response: "The Blue Shirt costs USD 29.99.".into(),
            confidence_score: 0.9,
            handoff_triggered: false,
            handoff_reason: None,
            reply_shape: ReplyShape::Text,
            prompt_tokens: 1000,
            completion_tokens: 40,
            total_tokens: 1040,
            estimated_cost: 0.0065,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn interaction_round_trip() {
        let recorder = recorder();
        let tenant = TenantId::new();
        let conversation = ConversationId::new();
        recorder.record_interaction(&interaction(&tenant, &conversation));

        let rows = recorder.interactions_for_conversation(&tenant, &conversation);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].detected_intents, vec!["PRICE_CHECK".to_string()]);
        assert_eq!(rows[0].response, "The Blue Shirt costs USD 29.99.");
    }

    #[test]
    fn failed_provider_call_is_recorded() {
        let recorder = recorder();
        let tenant = TenantId::new();
        recorder.record_provider_usage(&ProviderUsage {
            id: new_row_id(),
            tenant_id: tenant.clone(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            estimated_cost: 0.0,
            latency_ms: 120,
            success: false,
            finish_reason: None,
            was_failover: false,
            routing_reason: Some("Balanced performance - using GPT-4o".into()),
            complexity_score: Some(0.4),
            interaction_id: None,
            error: Some("provider unavailable".into()),
            created_at: chrono::Utc::now().to_rfc3339(),
        });

        let rows = recorder.usage_for_tenant(&tenant);
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
        assert_eq!(rows[0].error.as_deref(), Some("provider unavailable"));
    }
}
