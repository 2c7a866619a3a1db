use serde::{Deserialize, Serialize};

use mercato_core::types::{ConversationId, TenantId};

/// Shape of the reply that went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplyShape {
    #[default]
    Text,
    Button,
    List,
    Media,
}

impl ReplyShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyShape::Text => "text",
            ReplyShape::Button => "button",
            ReplyShape::List => "list",
            ReplyShape::Media => "media",
        }
    }
}

impl std::str::FromStr for ReplyShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(ReplyShape::Text),
            "button" => Ok(ReplyShape::Button),
            "list" => Ok(ReplyShape::List),
            "media" => Ok(ReplyShape::Media),
            other => Err(format!("unknown reply shape: {other}")),
        }
    }
}

/// Per-turn audit record: the full inbound/outbound pair with costs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInteraction {
    pub id: String,
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub customer_message: String,
    pub detected_intents: Vec<String>,
    pub model_used: String,
    pub context_tokens: u32,
    pub processing_time_ms: u64,
    pub response: String,
    pub confidence_score: f64,
    pub handoff_triggered: bool,
    pub handoff_reason: Option<String>,
    pub reply_shape: ReplyShape,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    pub created_at: String,
}

/// Per provider-call ledger entry; written for failures too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub id: String,
    pub tenant_id: TenantId,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub estimated_cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub finish_reason: Option<String>,
    pub was_failover: bool,
    pub routing_reason: Option<String>,
    pub complexity_score: Option<f64>,
    pub interaction_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}
