use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use mercato_core::config::MAX_MESSAGE_CHARS;
use mercato_core::types::{ConversationId, CustomerId, MessageId, TenantId};

use crate::db::init_db;
use crate::error::{ConversationError, Result};
use crate::types::*;

/// How long a `ConversationContext` stays warm after each access.
const CONTEXT_TTL_MINUTES: i64 = 30;

/// Thread-safe append-only conversation/message store.
///
/// Counters (low-confidence) are conditional SQL updates, never
/// read-modify-write in process memory. Appends assign a monotonic per
/// conversation `seq` inside one transaction so concurrent appends keep
/// total order.
pub struct ConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ── conversations ────────────────────────────────────────────────────────

    /// Return the customer's active conversation, creating one on first
    /// inbound message.
    pub fn get_or_create_active(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        channel: &str,
    ) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            let found = db
                .query_row(
                    "SELECT id, tenant_id, customer_id, state, channel, last_intent,
                            intent_confidence, low_confidence_count, last_agent, handoff_at,
                            metadata, created_at, updated_at
                     FROM conversations
                     WHERE tenant_id = ?1 AND customer_id = ?2 AND deleted = 0
                       AND state IN ('open', 'bot_handled', 'handed_off')
                     ORDER BY updated_at DESC LIMIT 1",
                    rusqlite::params![tenant_id.as_str(), customer_id.as_str()],
                    row_to_conversation,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(ConversationError::Database(other)),
                })?;
            if let Some(conversation) = found {
                return Ok(conversation);
            }
        }

        let id = ConversationId::new();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (id, tenant_id, customer_id, state, channel, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, '{}', ?5, ?5)",
            rusqlite::params![id.as_str(), tenant_id.as_str(), customer_id.as_str(), channel, now],
        )?;
        info!(tenant_id = %tenant_id, conversation_id = %id, "conversation created");

        Ok(Conversation {
            id,
            tenant_id: tenant_id.clone(),
            customer_id: customer_id.clone(),
            state: ConversationState::Open,
            channel: channel.to_string(),
            last_intent: None,
            intent_confidence: None,
            low_confidence_count: 0,
            last_agent: None,
            handoff_at: None,
            metadata: serde_json::json!({}),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, tenant_id: &TenantId, id: &ConversationId) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, customer_id, state, channel, last_intent,
                    intent_confidence, low_confidence_count, last_agent, handoff_at,
                    metadata, created_at, updated_at
             FROM conversations
             WHERE tenant_id = ?1 AND id = ?2 AND deleted = 0",
            rusqlite::params![tenant_id.as_str(), id.as_str()],
            row_to_conversation,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ConversationError::NotFound(id.to_string()),
            other => ConversationError::Database(other),
        })
    }

    pub fn list_for_tenant(&self, tenant_id: &TenantId, limit: usize) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, customer_id, state, channel, last_intent,
                    intent_confidence, low_confidence_count, last_agent, handoff_at,
                    metadata, created_at, updated_at
             FROM conversations
             WHERE tenant_id = ?1 AND deleted = 0
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![tenant_id.as_str(), limit as i64],
            row_to_conversation,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Transition conversation state, enforcing the lifecycle rules. A
    /// transition to handed-off stamps the timestamp, records the reason in
    /// metadata and resets the low-confidence counter.
    pub fn transition_state(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
        to: ConversationState,
        reason: Option<&str>,
        agent: Option<&str>,
    ) -> Result<Conversation> {
        let current = self.get(tenant_id, id)?;
        if !current.state.can_transition_to(to) {
            return Err(ConversationError::InvalidTransition {
                from: current.state.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        if to == ConversationState::HandedOff {
            let mut metadata = current.metadata.clone();
            if let Some(obj) = metadata.as_object_mut() {
                obj.insert(
                    "handoff_reason".to_string(),
                    serde_json::json!(reason.unwrap_or("unspecified")),
                );
                obj.insert("handoff_at".to_string(), serde_json::json!(now));
            }
            db.execute(
                "UPDATE conversations
                 SET state = ?3, handoff_at = ?4, last_agent = COALESCE(?5, last_agent),
                     metadata = ?6, low_confidence_count = 0, updated_at = ?4
                 WHERE tenant_id = ?1 AND id = ?2",
                rusqlite::params![
                    tenant_id.as_str(),
                    id.as_str(),
                    to.as_str(),
                    now,
                    agent,
                    serde_json::to_string(&metadata)?,
                ],
            )?;
            info!(conversation_id = %id, reason = reason.unwrap_or("unspecified"), "conversation handed off");
        } else {
            db.execute(
                "UPDATE conversations SET state = ?3, updated_at = ?4
                 WHERE tenant_id = ?1 AND id = ?2",
                rusqlite::params![tenant_id.as_str(), id.as_str(), to.as_str(), now],
            )?;
        }
        drop(db);
        self.get(tenant_id, id)
    }

    pub fn record_intent(
        &self,
        id: &ConversationId,
        intent: &str,
        confidence: f64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations
             SET last_intent = ?2, intent_confidence = ?3, updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![id.as_str(), intent, confidence, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Atomically bump the consecutive low-confidence counter; returns the
    /// post-increment value.
    pub fn increment_low_confidence(&self, id: &ConversationId) -> Result<u32> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations
             SET low_confidence_count = low_confidence_count + 1
             WHERE id = ?1",
            [id.as_str()],
        )?;
        let count: u32 = db.query_row(
            "SELECT low_confidence_count FROM conversations WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn reset_low_confidence(&self, id: &ConversationId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET low_confidence_count = 0 WHERE id = ?1",
            [id.as_str()],
        )?;
        Ok(())
    }

    pub fn soft_delete(&self, tenant_id: &TenantId, id: &ConversationId) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations SET deleted = 1, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id.as_str(), id.as_str(), Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(ConversationError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Lifecycle sweep: open conversations with no activity for `days` become
    /// dormant. Returns how many rows changed.
    pub fn mark_dormant_older_than(&self, tenant_id: &TenantId, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations SET state = 'dormant', updated_at = ?3
             WHERE tenant_id = ?1 AND state = 'open' AND updated_at < ?2 AND deleted = 0",
            rusqlite::params![tenant_id.as_str(), cutoff, Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    // ── messages ─────────────────────────────────────────────────────────────

    /// Append a message, assigning the next per-conversation sequence number
    /// inside one transaction. Rejects text over the channel limit and
    /// duplicate provider message ids.
    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
        message_type: MessageType,
        text: &str,
        payload: serde_json::Value,
        provider_msg_id: Option<&str>,
    ) -> Result<Message> {
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ConversationError::TextTooLong {
                len: text.chars().count(),
                max: MAX_MESSAGE_CHARS,
            });
        }

        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )?;
        let inserted = tx.execute(
            "INSERT INTO messages
             (id, conversation_id, seq, direction, message_type, text, payload,
              provider_msg_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                id.as_str(),
                conversation_id.as_str(),
                seq,
                direction.as_str(),
                message_type.as_str(),
                text,
                serde_json::to_string(&payload)?,
                provider_msg_id,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(ConversationError::DuplicateProviderMessageId(
                    provider_msg_id.unwrap_or_default().to_string(),
                ));
            }
            Err(e) => return Err(ConversationError::Database(e)),
        }
        tx.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            rusqlite::params![conversation_id.as_str(), now],
        )?;
        tx.commit()?;
        debug!(conversation_id = %conversation_id, seq, "message appended");

        Ok(Message {
            id,
            conversation_id: conversation_id.clone(),
            seq,
            direction,
            message_type,
            text: text.to_string(),
            payload,
            provider_msg_id: provider_msg_id.map(String::from),
            provider_status: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            error: None,
            created_at: now,
        })
    }

    /// Fetch the last `n` messages in chronological order.
    pub fn last_messages(&self, conversation_id: &ConversationId, n: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, seq, direction, message_type, text, payload,
                    provider_msg_id, provider_status, sent_at, delivered_at, read_at,
                    failed_at, error, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![conversation_id.as_str(), n as i64],
            row_to_message,
        )?;
        let mut messages: Vec<Message> = rows.filter_map(|r| r.ok()).collect();
        messages.reverse();
        Ok(messages)
    }

    pub fn count_messages(&self, conversation_id: &ConversationId) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Most recent inbound message text, if any. Used by the handoff policy.
    pub fn last_inbound_text(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT text FROM messages
             WHERE conversation_id = ?1 AND direction = 'in'
             ORDER BY seq DESC LIMIT 1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ConversationError::Database(other)),
        })
    }

    // ── delivery state (monotonic) ───────────────────────────────────────────

    pub fn mark_sent(&self, message_id: &MessageId, provider_msg_id: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages
             SET sent_at = ?2, provider_msg_id = COALESCE(?3, provider_msg_id),
                 provider_status = 'sent'
             WHERE id = ?1 AND sent_at IS NULL AND failed_at IS NULL",
            rusqlite::params![message_id.as_str(), now, provider_msg_id],
        )?;
        if n == 0 {
            return Err(ConversationError::DeliveryNotMonotonic(
                message_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn mark_delivered(&self, message_id: &MessageId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages
             SET delivered_at = ?2, provider_status = 'delivered'
             WHERE id = ?1 AND sent_at IS NOT NULL AND delivered_at IS NULL
               AND failed_at IS NULL",
            rusqlite::params![message_id.as_str(), now],
        )?;
        if n == 0 {
            return Err(ConversationError::DeliveryNotMonotonic(
                message_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages
             SET read_at = ?2, provider_status = 'read'
             WHERE id = ?1 AND delivered_at IS NOT NULL AND read_at IS NULL
               AND failed_at IS NULL",
            rusqlite::params![message_id.as_str(), now],
        )?;
        if n == 0 {
            return Err(ConversationError::DeliveryNotMonotonic(
                message_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn mark_failed(&self, message_id: &MessageId, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages
             SET failed_at = ?2, error = ?3, provider_status = 'failed'
             WHERE id = ?1 AND read_at IS NULL AND failed_at IS NULL",
            rusqlite::params![message_id.as_str(), now, error],
        )?;
        if n == 0 {
            return Err(ConversationError::DeliveryNotMonotonic(
                message_id.to_string(),
            ));
        }
        Ok(())
    }

    // ── conversation context ─────────────────────────────────────────────────

    /// Fetch the per-conversation soft memory, creating a fresh record when
    /// absent. An expired record is cleared (key facts preserved) and the
    /// expiry is extended by 30 minutes on every access.
    pub fn get_or_create_context(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationContext> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let new_expiry = (now + Duration::minutes(CONTEXT_TTL_MINUTES)).to_rfc3339();

        let db = self.db.lock().unwrap();
        let existing = db
            .query_row(
                "SELECT conversation_id, current_topic, key_facts, summary,
                        last_product_viewed, last_service_viewed, expires_at
                 FROM conversation_contexts WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                row_to_context,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(ConversationError::Database(other)),
            })?;

        let context = match existing {
            Some(ctx) if ctx.is_expired(&now_str) => {
                debug!(conversation_id = %conversation_id, "context expired, preserving key facts");
                let cleared = ConversationContext {
                    conversation_id: ctx.conversation_id,
                    current_topic: None,
                    key_facts: ctx.key_facts,
                    summary: None,
                    last_product_viewed: None,
                    last_service_viewed: None,
                    expires_at: new_expiry.clone(),
                };
                db.execute(
                    "UPDATE conversation_contexts
                     SET current_topic = NULL, summary = NULL,
                         last_product_viewed = NULL, last_service_viewed = NULL,
                         expires_at = ?2
                     WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id.as_str(), new_expiry],
                )?;
                cleared
            }
            Some(mut ctx) => {
                db.execute(
                    "UPDATE conversation_contexts SET expires_at = ?2
                     WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id.as_str(), new_expiry],
                )?;
                ctx.expires_at = new_expiry;
                ctx
            }
            None => {
                db.execute(
                    "INSERT INTO conversation_contexts (conversation_id, key_facts, expires_at)
                     VALUES (?1, '[]', ?2)",
                    rusqlite::params![conversation_id.as_str(), new_expiry],
                )?;
                ConversationContext {
                    conversation_id: conversation_id.clone(),
                    current_topic: None,
                    key_facts: Vec::new(),
                    summary: None,
                    last_product_viewed: None,
                    last_service_viewed: None,
                    expires_at: new_expiry,
                }
            }
        };
        Ok(context)
    }

    pub fn update_context(&self, context: &ConversationContext) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO conversation_contexts
             (conversation_id, current_topic, key_facts, summary,
              last_product_viewed, last_service_viewed, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                context.conversation_id.as_str(),
                context.current_topic,
                serde_json::to_string(&context.key_facts)?,
                context.summary,
                context.last_product_viewed,
                context.last_service_viewed,
                context.expires_at,
            ],
        )?;
        Ok(())
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let state: String = row.get(3)?;
    let metadata: String = row.get(10)?;
    Ok(Conversation {
        id: ConversationId::from(row.get::<_, String>(0)?),
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        customer_id: CustomerId::from(row.get::<_, String>(2)?),
        state: state.parse().unwrap_or(ConversationState::Open),
        channel: row.get(4)?,
        last_intent: row.get(5)?,
        intent_confidence: row.get(6)?,
        low_confidence_count: row.get::<_, i64>(7)? as u32,
        last_agent: row.get(8)?,
        handoff_at: row.get(9)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let direction: String = row.get(3)?;
    let message_type: String = row.get(4)?;
    let payload: String = row.get(6)?;
    Ok(Message {
        id: MessageId::from(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from(row.get::<_, String>(1)?),
        seq: row.get(2)?,
        direction: direction.parse().unwrap_or(Direction::In),
        message_type: message_type.parse().unwrap_or(MessageType::CustomerInbound),
        text: row.get(5)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::json!({})),
        provider_msg_id: row.get(7)?,
        provider_status: row.get(8)?,
        sent_at: row.get(9)?,
        delivered_at: row.get(10)?,
        read_at: row.get(11)?,
        failed_at: row.get(12)?,
        error: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn row_to_context(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationContext> {
    let facts: String = row.get(2)?;
    Ok(ConversationContext {
        conversation_id: ConversationId::from(row.get::<_, String>(0)?),
        current_topic: row.get(1)?,
        key_facts: serde_json::from_str(&facts).unwrap_or_default(),
        summary: row.get(3)?,
        last_product_viewed: row.get(4)?,
        last_service_viewed: row.get(5)?,
        expires_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn conversation(store: &ConversationStore) -> Conversation {
        store
            .get_or_create_active(&TenantId::from("t-1"), &CustomerId::from("c-1"), "whatsapp")
            .unwrap()
    }

    #[test]
    fn appends_preserve_arrival_order() {
        let store = store();
        let conv = conversation(&store);
        for text in ["first", "second", "third"] {
            store
                .append_message(
                    &conv.id,
                    Direction::In,
                    MessageType::CustomerInbound,
                    text,
                    serde_json::json!({}),
                    None,
                )
                .unwrap();
        }
        let messages = store.last_messages(&conv.id, 10).unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(
            messages.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn message_length_boundary() {
        let store = store();
        let conv = conversation(&store);
        let ok = "x".repeat(10_000);
        assert!(store
            .append_message(
                &conv.id,
                Direction::In,
                MessageType::CustomerInbound,
                &ok,
                serde_json::json!({}),
                None
            )
            .is_ok());
        let too_long = "x".repeat(10_001);
        assert!(matches!(
            store.append_message(
                &conv.id,
                Direction::In,
                MessageType::CustomerInbound,
                &too_long,
                serde_json::json!({}),
                None
            ),
            Err(ConversationError::TextTooLong { .. })
        ));
    }

    #[test]
    fn duplicate_provider_id_rejected() {
        let store = store();
        let conv = conversation(&store);
        store
            .append_message(
                &conv.id,
                Direction::In,
                MessageType::CustomerInbound,
                "hi",
                serde_json::json!({}),
                Some("wamid.1"),
            )
            .unwrap();
        assert!(matches!(
            store.append_message(
                &conv.id,
                Direction::In,
                MessageType::CustomerInbound,
                "hi again",
                serde_json::json!({}),
                Some("wamid.1"),
            ),
            Err(ConversationError::DuplicateProviderMessageId(_))
        ));
    }

    #[test]
    fn low_confidence_counter_round_trip() {
        let store = store();
        let conv = conversation(&store);
        assert_eq!(store.increment_low_confidence(&conv.id).unwrap(), 1);
        assert_eq!(store.increment_low_confidence(&conv.id).unwrap(), 2);
        store.reset_low_confidence(&conv.id).unwrap();
        let reloaded = store.get(&conv.tenant_id, &conv.id).unwrap();
        assert_eq!(reloaded.low_confidence_count, 0);
    }

    #[test]
    fn handoff_records_reason_and_resets_counter() {
        let store = store();
        let conv = conversation(&store);
        store.increment_low_confidence(&conv.id).unwrap();
        let updated = store
            .transition_state(
                &conv.tenant_id,
                &conv.id,
                ConversationState::HandedOff,
                Some("consecutive_low_confidence"),
                None,
            )
            .unwrap();
        assert_eq!(updated.state, ConversationState::HandedOff);
        assert_eq!(updated.low_confidence_count, 0);
        assert!(updated.handoff_at.is_some());
        assert_eq!(
            updated.metadata["handoff_reason"],
            serde_json::json!("consecutive_low_confidence")
        );
    }

    #[test]
    fn closed_conversation_rejects_handoff() {
        let store = store();
        let conv = conversation(&store);
        store
            .transition_state(&conv.tenant_id, &conv.id, ConversationState::Closed, None, None)
            .unwrap();
        assert!(matches!(
            store.transition_state(
                &conv.tenant_id,
                &conv.id,
                ConversationState::HandedOff,
                None,
                None
            ),
            Err(ConversationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn delivery_states_are_monotonic() {
        let store = store();
        let conv = conversation(&store);
        let msg = store
            .append_message(
                &conv.id,
                Direction::Out,
                MessageType::BotResponse,
                "hello",
                serde_json::json!({}),
                None,
            )
            .unwrap();

        // Delivered before sent is rejected.
        assert!(store.mark_delivered(&msg.id).is_err());
        store.mark_sent(&msg.id, Some("wamid.9")).unwrap();
        store.mark_delivered(&msg.id).unwrap();
        store.mark_read(&msg.id).unwrap();
        // No going back and no failing after read.
        assert!(store.mark_sent(&msg.id, None).is_err());
        assert!(store.mark_failed(&msg.id, "late").is_err());
    }

    #[test]
    fn context_expiry_preserves_key_facts() {
        let store = store();
        let conv = conversation(&store);
        let mut ctx = store.get_or_create_context(&conv.id).unwrap();
        ctx.current_topic = Some("haircut".into());
        ctx.summary = Some("customer wants a trim".into());
        ctx.key_facts = vec!["prefers Saturdays".into()];
        ctx.expires_at = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        store.update_context(&ctx).unwrap();

        let refreshed = store.get_or_create_context(&conv.id).unwrap();
        assert_eq!(refreshed.key_facts, vec!["prefers Saturdays".to_string()]);
        assert!(refreshed.current_topic.is_none());
        assert!(refreshed.summary.is_none());
        assert!(!refreshed.is_expired(&Utc::now().to_rfc3339()));
    }
}
