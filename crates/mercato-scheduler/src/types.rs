use serde::{Deserialize, Serialize};

use mercato_core::types::{CustomerId, TenantId};

/// Lifecycle of a scheduled message. `Processing` is the transient claim
/// state used for at-most-once delivery under concurrent workers; every
/// claimed row terminates as sent or failed within its dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Canceled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledStatus::Pending => "pending",
            ScheduledStatus::Processing => "processing",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
            ScheduledStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for ScheduledStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduledStatus::Pending),
            "processing" => Ok(ScheduledStatus::Processing),
            "sent" => Ok(ScheduledStatus::Sent),
            "failed" => Ok(ScheduledStatus::Failed),
            "canceled" => Ok(ScheduledStatus::Canceled),
            other => Err(format!("unknown scheduled status: {other}")),
        }
    }
}

/// A message to be delivered at a future time. `customer_id = None` marks a
/// broadcast that expands into per-recipient rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub tenant_id: TenantId,
    pub customer_id: Option<CustomerId>,
    pub content: String,
    pub template: Option<String>,
    pub template_context: serde_json::Value,
    pub scheduled_at: String,
    pub status: ScheduledStatus,
    pub recipient_criteria: serde_json::Value,
    /// Message type string driving consent checks (e.g. "scheduled_promotional").
    pub message_type: String,
    pub sent_at: Option<String>,
    pub failed_at: Option<String>,
    pub error: Option<String>,
    /// The outbound Message created on successful delivery.
    pub message_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// Campaign lifecycle: draft → scheduled → sending → completed; canceled is
/// valid only from draft or scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
    Canceled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "completed" => Ok(CampaignStatus::Completed),
            "canceled" => Ok(CampaignStatus::Canceled),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// One A/B test arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignVariant {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub customer_ids: Vec<String>,
    #[serde(default)]
    pub delivered: u32,
    #[serde(default)]
    pub failed: u32,
}

/// Broadcast orchestration record with delivery/engagement counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCampaign {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: String,
    pub message_content: String,
    pub target_criteria: serde_json::Value,
    pub variants: Vec<CampaignVariant>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<String>,
    pub delivery_count: u32,
    pub delivered_count: u32,
    pub failed_count: u32,
    pub read_count: u32,
    pub response_count: u32,
    pub conversion_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}
