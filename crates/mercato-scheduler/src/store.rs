use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use mercato_core::types::{CustomerId, TenantId};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::*;

/// Store for scheduled messages and campaigns.
///
/// Cross-worker coordination uses conditional writes on the row status, not
/// locks: the `pending → processing` claim provides at-most-once delivery.
pub struct ScheduleStore {
    db: Arc<Mutex<Connection>>,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ── scheduled messages ───────────────────────────────────────────────────

    /// Create a scheduled message. `scheduled_at` must be strictly in the
    /// future at creation time.
    #[allow(clippy::too_many_arguments)]
    pub fn create_scheduled(
        &self,
        tenant_id: &TenantId,
        customer_id: Option<&CustomerId>,
        content: &str,
        template: Option<&str>,
        template_context: serde_json::Value,
        scheduled_at: &str,
        message_type: &str,
        recipient_criteria: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<ScheduledMessage> {
        let now = Utc::now().to_rfc3339();
        if scheduled_at <= now.as_str() {
            return Err(SchedulerError::ScheduledInPast);
        }
        self.insert_row(
            tenant_id,
            customer_id,
            content,
            template,
            template_context,
            scheduled_at,
            message_type,
            recipient_criteria,
            metadata,
        )
    }

    /// Internal insert used by campaign expansion, which may schedule for
    /// "now" because the campaign itself was validated at creation.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_row(
        &self,
        tenant_id: &TenantId,
        customer_id: Option<&CustomerId>,
        content: &str,
        template: Option<&str>,
        template_context: serde_json::Value,
        scheduled_at: &str,
        message_type: &str,
        recipient_criteria: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<ScheduledMessage> {
        let message = ScheduledMessage {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            customer_id: customer_id.cloned(),
            content: content.to_string(),
            template: template.map(String::from),
            template_context,
            scheduled_at: scheduled_at.to_string(),
            status: ScheduledStatus::Pending,
            recipient_criteria,
            message_type: message_type.to_string(),
            sent_at: None,
            failed_at: None,
            error: None,
            message_id: None,
            metadata,
            created_at: Utc::now().to_rfc3339(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO scheduled_messages
             (id, tenant_id, customer_id, content, template, template_context,
              scheduled_at, status, recipient_criteria, message_type, metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'pending',?8,?9,?10,?11)",
            rusqlite::params![
                message.id,
                tenant_id.as_str(),
                customer_id.map(|c| c.as_str()),
                message.content,
                message.template,
                serde_json::to_string(&message.template_context)?,
                message.scheduled_at,
                serde_json::to_string(&message.recipient_criteria)?,
                message.message_type,
                serde_json::to_string(&message.metadata)?,
                message.created_at,
            ],
        )?;
        debug!(scheduled_id = %message.id, tenant_id = %tenant_id, "scheduled message created");
        Ok(message)
    }

    pub fn get(&self, id: &str) -> Result<ScheduledMessage> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, customer_id, content, template, template_context,
                    scheduled_at, status, recipient_criteria, message_type, sent_at,
                    failed_at, error, message_id, metadata, created_at
             FROM scheduled_messages WHERE id = ?1",
            [id],
            row_to_scheduled,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SchedulerError::NotFound(id.to_string()),
            other => SchedulerError::Database(other),
        })
    }

    /// Messages due for dispatch: pending with scheduled_at ≤ now.
    pub fn due_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, customer_id, content, template, template_context,
                    scheduled_at, status, recipient_criteria, message_type, sent_at,
                    failed_at, error, message_id, metadata, created_at
             FROM scheduled_messages
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![now, limit as i64], row_to_scheduled)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Conditional claim: pending → processing. Returns false when another
    /// worker claimed the row first.
    pub fn claim(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages SET status = 'processing'
             WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(n == 1)
    }

    /// Put a claimed message back to pending with a new due time
    /// (quiet-hours reschedule).
    pub fn reschedule(&self, id: &str, new_scheduled_at: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages SET status = 'pending', scheduled_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            rusqlite::params![id, new_scheduled_at],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        info!(scheduled_id = id, until = new_scheduled_at, "message rescheduled past quiet hours");
        Ok(())
    }

    /// Terminal success. The attached outbound message must belong to the
    /// same tenant as the scheduled row.
    pub fn mark_sent(
        &self,
        id: &str,
        message_id: &str,
        message_tenant: &TenantId,
    ) -> Result<ScheduledMessage> {
        let row = self.get(id)?;
        if row.tenant_id != *message_tenant {
            return Err(SchedulerError::TenantMismatch);
        }
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages
             SET status = 'sent', sent_at = ?2, message_id = ?3
             WHERE id = ?1 AND status = 'processing'",
            rusqlite::params![id, now, message_id],
        )?;
        drop(db);
        if n == 0 {
            return Err(SchedulerError::InvalidTransition {
                from: row.status.as_str().to_string(),
                to: "sent".to_string(),
            });
        }
        self.get(id)
    }

    /// Terminal state for a broadcast row that was expanded into
    /// per-recipient messages; it emits no Message itself.
    pub fn mark_expanded(&self, id: &str) -> Result<ScheduledMessage> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages SET status = 'sent', sent_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            rusqlite::params![id, now],
        )?;
        drop(db);
        if n == 0 {
            let row = self.get(id)?;
            return Err(SchedulerError::InvalidTransition {
                from: row.status.as_str().to_string(),
                to: "sent".to_string(),
            });
        }
        self.get(id)
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<ScheduledMessage> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages
             SET status = 'failed', failed_at = ?2, error = ?3
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            rusqlite::params![id, now, error],
        )?;
        drop(db);
        if n == 0 {
            let row = self.get(id)?;
            return Err(SchedulerError::InvalidTransition {
                from: row.status.as_str().to_string(),
                to: "failed".to_string(),
            });
        }
        self.get(id)
    }

    /// Cancel is only valid while pending.
    pub fn cancel(&self, tenant_id: &TenantId, id: &str) -> Result<ScheduledMessage> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE scheduled_messages SET status = 'canceled'
             WHERE id = ?1 AND tenant_id = ?2 AND status = 'pending'",
            rusqlite::params![id, tenant_id.as_str()],
        )?;
        drop(db);
        if n == 0 {
            let row = self.get(id)?;
            return Err(SchedulerError::InvalidTransition {
                from: row.status.as_str().to_string(),
                to: "canceled".to_string(),
            });
        }
        self.get(id)
    }

    // ── campaigns ────────────────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        tenant_id: &TenantId,
        name: &str,
        description: &str,
        message_content: &str,
        target_criteria: serde_json::Value,
        variants: Vec<CampaignVariant>,
        created_by: Option<&str>,
        campaign_quota: u32,
    ) -> Result<MessageCampaign> {
        // Quota counts campaigns created this calendar month.
        let month_start = Utc::now().format("%Y-%m-01T00:00:00Z").to_string();
        {
            let db = self.db.lock().unwrap();
            let used: u32 = db.query_row(
                "SELECT COUNT(*) FROM message_campaigns
                 WHERE tenant_id = ?1 AND created_at >= ?2 AND status != 'canceled'",
                rusqlite::params![tenant_id.as_str(), month_start],
                |row| row.get(0),
            )?;
            if used >= campaign_quota {
                return Err(SchedulerError::QuotaExceeded {
                    used,
                    quota: campaign_quota,
                });
            }
        }

        let campaign = MessageCampaign {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            message_content: message_content.to_string(),
            target_criteria,
            variants,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            delivery_count: 0,
            delivered_count: 0,
            failed_count: 0,
            read_count: 0,
            response_count: 0,
            conversion_count: 0,
            started_at: None,
            completed_at: None,
            created_by: created_by.map(String::from),
            created_at: Utc::now().to_rfc3339(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO message_campaigns
             (id, tenant_id, name, description, message_content, target_criteria,
              variants, status, created_by, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'draft',?8,?9)",
            rusqlite::params![
                campaign.id,
                tenant_id.as_str(),
                campaign.name,
                campaign.description,
                campaign.message_content,
                serde_json::to_string(&campaign.target_criteria)?,
                serde_json::to_string(&campaign.variants)?,
                campaign.created_by,
                campaign.created_at,
            ],
        )?;
        info!(campaign_id = %campaign.id, tenant_id = %tenant_id, "campaign created");
        Ok(campaign)
    }

    pub fn get_campaign(&self, id: &str) -> Result<MessageCampaign> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, name, description, message_content, target_criteria,
                    variants, status, scheduled_at, delivery_count, delivered_count,
                    failed_count, read_count, response_count, conversion_count,
                    started_at, completed_at, created_by, created_at
             FROM message_campaigns WHERE id = ?1",
            [id],
            row_to_campaign,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SchedulerError::CampaignNotFound(id.to_string())
            }
            other => SchedulerError::Database(other),
        })
    }

    pub fn schedule_campaign(&self, id: &str, scheduled_at: &str) -> Result<MessageCampaign> {
        let now = Utc::now().to_rfc3339();
        if scheduled_at <= now.as_str() {
            return Err(SchedulerError::ScheduledInPast);
        }
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE message_campaigns SET status = 'scheduled', scheduled_at = ?2
             WHERE id = ?1 AND status = 'draft'",
            rusqlite::params![id, scheduled_at],
        )?;
        drop(db);
        if n == 0 {
            let campaign = self.get_campaign(id)?;
            return Err(SchedulerError::InvalidTransition {
                from: campaign.status.as_str().to_string(),
                to: "scheduled".to_string(),
            });
        }
        self.get_campaign(id)
    }

    /// Cancel is valid only from draft or scheduled.
    pub fn cancel_campaign(&self, tenant_id: &TenantId, id: &str) -> Result<MessageCampaign> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE message_campaigns SET status = 'canceled'
             WHERE id = ?1 AND tenant_id = ?2 AND status IN ('draft', 'scheduled')",
            rusqlite::params![id, tenant_id.as_str()],
        )?;
        drop(db);
        if n == 0 {
            let campaign = self.get_campaign(id)?;
            return Err(SchedulerError::InvalidTransition {
                from: campaign.status.as_str().to_string(),
                to: "canceled".to_string(),
            });
        }
        self.get_campaign(id)
    }

    /// Start a campaign: scheduled → sending, then expand one ScheduledMessage
    /// per recipient. A/B variant assignment is a deterministic hash of the
    /// customer id modulo the number of variants.
    pub fn start_campaign(
        &self,
        id: &str,
        recipients: &[CustomerId],
    ) -> Result<Vec<ScheduledMessage>> {
        let campaign = self.get_campaign(id)?;
        let now = Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            let n = db.execute(
                "UPDATE message_campaigns SET status = 'sending', started_at = ?2
                 WHERE id = ?1 AND status IN ('scheduled', 'draft')",
                rusqlite::params![id, now],
            )?;
            if n == 0 {
                return Err(SchedulerError::InvalidTransition {
                    from: campaign.status.as_str().to_string(),
                    to: "sending".to_string(),
                });
            }
        }

        let mut expanded = Vec::with_capacity(recipients.len());
        for customer_id in recipients {
            let content = if campaign.variants.is_empty() {
                campaign.message_content.clone()
            } else {
                let index = variant_index(customer_id.as_str(), campaign.variants.len());
                campaign.variants[index].content.clone()
            };
            let row = self.insert_row(
                &campaign.tenant_id,
                Some(customer_id),
                &content,
                None,
                serde_json::json!({}),
                &now,
                "scheduled_promotional",
                serde_json::json!({}),
                serde_json::json!({ "campaign_id": campaign.id }),
            )?;
            self.increment_campaign_counter(id, "delivery_count")?;
            expanded.push(row);
        }
        info!(campaign_id = id, recipients = expanded.len(), "campaign expanded");
        Ok(expanded)
    }

    /// Atomic counter bump via conditional SQL, never read-modify-write.
    pub fn increment_campaign_counter(&self, id: &str, counter: &str) -> Result<()> {
        let column = match counter {
            "delivery_count" | "delivered_count" | "failed_count" | "read_count"
            | "response_count" | "conversion_count" => counter,
            other => {
                return Err(SchedulerError::InvalidTransition {
                    from: "counter".into(),
                    to: other.to_string(),
                })
            }
        };
        let db = self.db.lock().unwrap();
        db.execute(
            &format!("UPDATE message_campaigns SET {column} = {column} + 1 WHERE id = ?1"),
            [id],
        )?;
        Ok(())
    }

    /// Complete a sending campaign once none of its expanded messages remain
    /// pending or processing.
    pub fn maybe_complete_campaign(&self, id: &str) -> Result<bool> {
        let open: u32 = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT COUNT(*) FROM scheduled_messages
                 WHERE status IN ('pending', 'processing')
                   AND json_extract(metadata, '$.campaign_id') = ?1",
                [id],
                |row| row.get(0),
            )?
        };
        if open > 0 {
            return Ok(false);
        }
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE message_campaigns SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status = 'sending'",
            rusqlite::params![id, now],
        )?;
        Ok(n == 1)
    }
}

/// Deterministic A/B arm for a customer: sha256 of the id modulo arm count.
pub fn variant_index(customer_id: &str, variant_count: usize) -> usize {
    let digest = Sha256::digest(customer_id.as_bytes());
    let mut value = [0u8; 8];
    value.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(value) % variant_count as u64) as usize
}

fn row_to_scheduled(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    let status: String = row.get(7)?;
    let template_context: String = row.get(5)?;
    let criteria: String = row.get(8)?;
    let metadata: String = row.get(14)?;
    Ok(ScheduledMessage {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        customer_id: row.get::<_, Option<String>>(2)?.map(CustomerId::from),
        content: row.get(3)?,
        template: row.get(4)?,
        template_context: serde_json::from_str(&template_context)
            .unwrap_or(serde_json::json!({})),
        scheduled_at: row.get(6)?,
        status: status.parse().unwrap_or(ScheduledStatus::Pending),
        recipient_criteria: serde_json::from_str(&criteria).unwrap_or(serde_json::json!({})),
        message_type: row.get(9)?,
        sent_at: row.get(10)?,
        failed_at: row.get(11)?,
        error: row.get(12)?,
        message_id: row.get(13)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: row.get(15)?,
    })
}

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageCampaign> {
    let criteria: String = row.get(5)?;
    let variants: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(MessageCampaign {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        message_content: row.get(4)?,
        target_criteria: serde_json::from_str(&criteria).unwrap_or(serde_json::json!({})),
        variants: serde_json::from_str(&variants).unwrap_or_default(),
        status: status.parse().unwrap_or(CampaignStatus::Draft),
        scheduled_at: row.get(8)?,
        delivery_count: row.get(9)?,
        delivered_count: row.get(10)?,
        failed_count: row.get(11)?,
        read_count: row.get(12)?,
        response_count: row.get(13)?,
        conversion_count: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
        created_by: row.get(17)?,
        created_at: row.get(18)?,
    })
}
