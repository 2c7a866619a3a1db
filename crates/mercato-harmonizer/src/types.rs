use serde::{Deserialize, Serialize};

use mercato_core::types::{ConversationId, TenantId};

/// Lifecycle of a buffered inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Processed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "processed" => Ok(QueueStatus::Processed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// One buffered inbound message awaiting burst aggregation.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub message_id: String,
    pub text: String,
    pub status: QueueStatus,
    pub queued_at: String,
    pub processed_at: Option<String>,
    pub error: Option<String>,
}

/// A harmonized turn: one or more rapid messages combined into a single
/// logical input for the agent, texts joined by newlines in arrival order.
#[derive(Debug, Clone)]
pub struct LogicalTurn {
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub combined_text: String,
    pub message_ids: Vec<String>,
    pub entry_ids: Vec<i64>,
}
