//! Due-time dispatch worker: polls pending scheduled messages on a short
//! cadence, re-checks consent and quiet hours, renders templates, claims the
//! row and delivers through the channel gateway with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use mercato_channels::{ChannelGateway, GatewayError, OutboundPayload};
use mercato_conversations::types::{Direction, MessageType};
use mercato_conversations::ConversationStore;
use mercato_core::config::{CHANNEL_SEND_TIMEOUT_SECS, SCHEDULER_POLL_SECS};
use mercato_core::types::CustomerId;
use mercato_tenants::types::QuietHours;
use mercato_tenants::TenantStore;

use crate::error::Result;
use crate::store::ScheduleStore;
use crate::template::render;
use crate::types::{ScheduledMessage, ScheduledStatus};

const MAX_SEND_ATTEMPTS: u32 = 3;
const DISPATCH_BATCH: usize = 50;

pub struct Dispatcher {
    schedules: Arc<ScheduleStore>,
    tenants: Arc<TenantStore>,
    conversations: Arc<ConversationStore>,
    gateway: Arc<dyn ChannelGateway>,
    poll_interval: Duration,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        schedules: Arc<ScheduleStore>,
        tenants: Arc<TenantStore>,
        conversations: Arc<ConversationStore>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            schedules,
            tenants,
            conversations,
            gateway,
            poll_interval: Duration::from_secs(SCHEDULER_POLL_SECS),
            send_timeout: Duration::from_secs(CHANNEL_SEND_TIMEOUT_SECS),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, send_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.send_timeout = send_timeout;
        self
    }

    /// Main worker loop. Polls until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler dispatcher started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch_due().await {
                        error!("dispatch tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process everything currently due. Public so tests and the gateway can
    /// drive a tick directly.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let due = self.schedules.due_pending(DISPATCH_BATCH)?;
        let mut dispatched = 0;
        for row in due {
            match self.process_one(row).await {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(error = %e, "scheduled dispatch failed"),
            }
        }
        Ok(dispatched)
    }

    async fn process_one(&self, row: ScheduledMessage) -> Result<()> {
        // The conditional claim provides at-most-once delivery under
        // concurrent workers.
        if !self.schedules.claim(&row.id)? {
            return Ok(());
        }

        let Some(customer_id) = row.customer_id.clone() else {
            return self.expand_broadcast(&row).await;
        };

        let tenant = match self.tenants.get_tenant(&row.tenant_id) {
            Ok(tenant) => tenant,
            Err(e) => {
                self.finish_failed(&row, &format!("tenant lookup failed: {e}"))?;
                return Ok(());
            }
        };

        // Consent gate: transactional bypasses everything; reminder needs
        // reminder consent; promotional (incl. re-engagement) needs opt-in.
        let bypass_consent = matches!(
            row.message_type.as_str(),
            "automated_transactional" | "transactional"
        );
        if !bypass_consent {
            let preferences = self
                .tenants
                .get_or_create_preferences(&row.tenant_id, &customer_id)
                .map_err(|e| crate::error::SchedulerError::Tenant(e.to_string()))?;
            if !preferences.has_consent_for(&row.message_type) {
                info!(
                    scheduled_id = %row.id,
                    message_type = %row.message_type,
                    "dropping scheduled message: no consent"
                );
                self.finish_failed(
                    &row,
                    &format!(
                        "no_consent: customer has not consented to {} messages",
                        row.message_type
                    ),
                )?;
                return Ok(());
            }

            // Quiet hours: push non-transactional sends to the window end.
            if let Some(quiet) = &tenant.quiet_hours {
                let now = Utc::now();
                let hhmm = now.format("%H:%M").to_string();
                if quiet.contains(&hhmm) {
                    let resume_at = next_window_end(quiet, now);
                    self.schedules.reschedule(&row.id, &resume_at.to_rfc3339())?;
                    return Ok(());
                }
            }
        }

        let customer = match self.tenants.get_customer(&row.tenant_id, &customer_id) {
            Ok(customer) => customer,
            Err(e) => {
                self.finish_failed(&row, &format!("customer lookup failed: {e}"))?;
                return Ok(());
            }
        };

        let body = render(&row.content, &row.template_context);
        let payload = OutboundPayload::Text { body: body.clone() };

        match self
            .send_with_retries(&tenant.channel_credentials, &customer.phone, &payload)
            .await
        {
            Ok(receipt) => {
                let conversation = self.conversations.get_or_create_active(
                    &row.tenant_id,
                    &customer_id,
                    "whatsapp",
                )?;
                let message_type = row
                    .message_type
                    .parse::<MessageType>()
                    .unwrap_or(MessageType::ScheduledPromotional);
                let message = self.conversations.append_message(
                    &conversation.id,
                    Direction::Out,
                    message_type,
                    &body,
                    serde_json::json!({ "scheduled_message_id": row.id }),
                    Some(&receipt.provider_message_id),
                )?;
                self.conversations
                    .mark_sent(&message.id, Some(&receipt.provider_message_id))?;
                self.schedules
                    .mark_sent(&row.id, message.id.as_str(), &row.tenant_id)?;
                self.bump_campaign(&row, "delivered_count")?;
                info!(scheduled_id = %row.id, message_id = %message.id, "scheduled message delivered");
            }
            Err(e) => {
                self.finish_failed(&row, &e.to_string())?;
            }
        }
        Ok(())
    }

    /// Expand a broadcast row into per-recipient pending messages.
    async fn expand_broadcast(&self, row: &ScheduledMessage) -> Result<()> {
        let tag_filter: Vec<String> = row
            .recipient_criteria
            .get("tags")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let customers = self
            .tenants
            .list_customers(&row.tenant_id, 10_000)
            .unwrap_or_default();
        let recipients: Vec<CustomerId> = customers
            .into_iter()
            .filter(|c| {
                tag_filter.is_empty() || c.tags.iter().any(|t| tag_filter.contains(t))
            })
            .map(|c| c.id)
            .collect();

        let now = Utc::now().to_rfc3339();
        for customer_id in &recipients {
            self.schedules.insert_row(
                &row.tenant_id,
                Some(customer_id),
                &row.content,
                row.template.as_deref(),
                row.template_context.clone(),
                &now,
                &row.message_type,
                serde_json::json!({}),
                row.metadata.clone(),
            )?;
        }
        self.schedules.mark_expanded(&row.id)?;
        info!(scheduled_id = %row.id, recipients = recipients.len(), "broadcast expanded");
        Ok(())
    }

    async fn send_with_retries(
        &self,
        credentials: &serde_json::Value,
        to: &str,
        payload: &OutboundPayload,
    ) -> std::result::Result<mercato_channels::SendReceipt, GatewayError> {
        let mut last_error = GatewayError::Transient("not attempted".into());
        for attempt in 0..MAX_SEND_ATTEMPTS {
            let result = tokio::time::timeout(
                self.send_timeout,
                self.gateway.send(credentials, to, payload),
            )
            .await;
            match result {
                Ok(Ok(receipt)) => return Ok(receipt),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = GatewayError::Transient(format!(
                        "send timed out after {}s",
                        self.send_timeout.as_secs()
                    ))
                }
            }
            if attempt + 1 < MAX_SEND_ATTEMPTS {
                let jitter = rand::random::<u64>() % 250;
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt) + jitter);
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_error)
    }

    fn finish_failed(&self, row: &ScheduledMessage, error: &str) -> Result<()> {
        self.schedules.mark_failed(&row.id, error)?;
        self.bump_campaign(row, "failed_count")?;
        Ok(())
    }

    fn bump_campaign(&self, row: &ScheduledMessage, counter: &str) -> Result<()> {
        if let Some(campaign_id) = row.metadata.get("campaign_id").and_then(|v| v.as_str()) {
            self.schedules.increment_campaign_counter(campaign_id, counter)?;
            self.schedules.maybe_complete_campaign(campaign_id)?;
        }
        Ok(())
    }
}

/// The next instant the quiet-hours window ends, from `now`.
fn next_window_end(quiet: &QuietHours, now: DateTime<Utc>) -> DateTime<Utc> {
    let parse = |hhmm: &str| -> (u32, u32) {
        let mut parts = hhmm.splitn(2, ':');
        let hour = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minute = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        (hour, minute)
    };
    let (end_hour, end_minute) = parse(&quiet.end);
    let today_end = now
        .with_hour(end_hour)
        .and_then(|t| t.with_minute(end_minute))
        .and_then(|t| t.with_second(0))
        .unwrap_or(now);
    if today_end > now {
        today_end
    } else {
        today_end + ChronoDuration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mercato_channels::SendReceipt;
    use mercato_tenants::types::{ConsentKind, ConsentSource, TenantLimits};
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockGateway {
        sends: AtomicU32,
        fail_first: AtomicU32,
    }

    impl MockGateway {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                sends: AtomicU32::new(0),
                fail_first: AtomicU32::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl ChannelGateway for MockGateway {
        async fn send(
            &self,
            _credentials: &serde_json::Value,
            to: &str,
            _payload: &OutboundPayload,
        ) -> std::result::Result<SendReceipt, GatewayError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first.load(Ordering::SeqCst) {
                return Err(GatewayError::Transient("gateway hiccup".into()));
            }
            Ok(SendReceipt {
                provider_message_id: format!("wamid.{to}.{n}"),
                accepted_status: "accepted".into(),
            })
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        schedules: Arc<ScheduleStore>,
        tenants: Arc<TenantStore>,
        conversations: Arc<ConversationStore>,
        tenant: mercato_tenants::types::Tenant,
        customer: mercato_tenants::types::Customer,
    }

    fn fixture(gateway: Arc<dyn ChannelGateway>) -> Fixture {
        let schedules =
            Arc::new(ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let tenants = Arc::new(TenantStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let conversations =
            Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let tenant = tenants
            .create_tenant(
                "Acme",
                "+254700000001",
                vec!["en".into()],
                None,
                TenantLimits::default(),
            )
            .unwrap();
        let customer = tenants
            .get_or_create_customer(&tenant.id, "+254711222333")
            .unwrap();
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&schedules),
                Arc::clone(&tenants),
                Arc::clone(&conversations),
                gateway,
            )
            .with_timing(Duration::from_millis(10), Duration::from_secs(1)),
        );
        Fixture {
            dispatcher,
            schedules,
            tenants,
            conversations,
            tenant,
            customer,
        }
    }

    fn due_row(f: &Fixture, message_type: &str) -> ScheduledMessage {
        // insert_row allows scheduled_at = now so the row is immediately due.
        f.schedules
            .insert_row(
                &f.tenant.id,
                Some(&f.customer.id),
                "Hi {{name}}, see you soon!",
                None,
                serde_json::json!({ "name": "Wanjiku" }),
                &Utc::now().to_rfc3339(),
                message_type,
                serde_json::json!({}),
                serde_json::json!({}),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn promotional_without_consent_fails_with_no_message() {
        let f = fixture(MockGateway::new(0));
        let row = due_row(&f, "scheduled_promotional");

        f.dispatcher.dispatch_due().await.unwrap();

        let reloaded = f.schedules.get(&row.id).unwrap();
        assert_eq!(reloaded.status, ScheduledStatus::Failed);
        assert!(reloaded.error.as_deref().unwrap().contains("no_consent"));
        assert!(reloaded.message_id.is_none());
        // No outbound message was created anywhere.
        let conversations = f.conversations.list_for_tenant(&f.tenant.id, 10).unwrap();
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn opted_in_promotional_is_delivered_with_rendered_template() {
        let f = fixture(MockGateway::new(0));
        f.tenants
            .set_consent(
                &f.tenant.id,
                &f.customer.id,
                ConsentKind::PromotionalMessages,
                true,
                ConsentSource::Customer,
                None,
                None,
            )
            .unwrap();
        let row = due_row(&f, "scheduled_promotional");

        f.dispatcher.dispatch_due().await.unwrap();

        let reloaded = f.schedules.get(&row.id).unwrap();
        assert_eq!(reloaded.status, ScheduledStatus::Sent);
        let message_id = reloaded.message_id.expect("message attached");

        let conversation = &f.conversations.list_for_tenant(&f.tenant.id, 10).unwrap()[0];
        let messages = f.conversations.last_messages(&conversation.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_str(), message_id);
        assert_eq!(messages[0].text, "Hi Wanjiku, see you soon!");
        assert!(messages[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn transactional_bypasses_consent() {
        let f = fixture(MockGateway::new(0));
        let row = due_row(&f, "automated_transactional");

        f.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(
            f.schedules.get(&row.id).unwrap().status,
            ScheduledStatus::Sent
        );
    }

    #[tokio::test]
    async fn transient_gateway_failure_is_retried() {
        let gateway = MockGateway::new(2);
        let f = fixture(gateway.clone());
        let row = due_row(&f, "automated_reminder");

        f.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(
            f.schedules.get(&row.id).unwrap().status,
            ScheduledStatus::Sent
        );
        assert_eq!(gateway.sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed() {
        let f = fixture(MockGateway::new(10));
        let row = due_row(&f, "automated_reminder");

        f.dispatcher.dispatch_due().await.unwrap();
        let reloaded = f.schedules.get(&row.id).unwrap();
        assert_eq!(reloaded.status, ScheduledStatus::Failed);
        assert!(reloaded.error.is_some());
    }

    #[tokio::test]
    async fn quiet_hours_reschedules_reminder() {
        let f = fixture(MockGateway::new(0));
        // A window covering the whole day guarantees "now" is inside it.
        let quiet = QuietHours {
            start: "00:00".into(),
            end: "23:59".into(),
        };
        let tenant = f
            .tenants
            .create_tenant(
                "Quiet Co",
                "+254700000002",
                vec!["en".into()],
                Some(quiet),
                TenantLimits::default(),
            )
            .unwrap();
        let customer = f
            .tenants
            .get_or_create_customer(&tenant.id, "+254711999888")
            .unwrap();
        let row = f
            .schedules
            .insert_row(
                &tenant.id,
                Some(&customer.id),
                "reminder",
                None,
                serde_json::json!({}),
                &Utc::now().to_rfc3339(),
                "automated_reminder",
                serde_json::json!({}),
                serde_json::json!({}),
            )
            .unwrap();

        f.dispatcher.dispatch_due().await.unwrap();

        let reloaded = f.schedules.get(&row.id).unwrap();
        assert_eq!(reloaded.status, ScheduledStatus::Pending);
        assert!(reloaded.scheduled_at > row.scheduled_at);
    }

    #[test]
    fn window_end_rolls_to_tomorrow_when_passed() {
        let quiet = QuietHours {
            start: "21:00".into(),
            end: "07:00".into(),
        };
        let now = "2026-03-01T22:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = next_window_end(&quiet, now);
        assert_eq!(end.to_rfc3339(), "2026-03-02T07:00:00+00:00");
    }
}
