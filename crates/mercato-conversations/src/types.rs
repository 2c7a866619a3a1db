use serde::{Deserialize, Serialize};

use mercato_core::types::{ConversationId, CustomerId, MessageId, TenantId};

/// Conversation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Open,
    BotHandled,
    HandedOff,
    Closed,
    Dormant,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Open => "open",
            ConversationState::BotHandled => "bot_handled",
            ConversationState::HandedOff => "handed_off",
            ConversationState::Closed => "closed",
            ConversationState::Dormant => "dormant",
        }
    }

    /// Allowed transitions. Open/bot states move freely between themselves
    /// and forward; closed and dormant can only reopen.
    pub fn can_transition_to(&self, to: ConversationState) -> bool {
        use ConversationState::*;
        match (self, to) {
            (a, b) if *a == b => true,
            (Open, _) => true,
            (BotHandled, _) => true,
            (HandedOff, Open | BotHandled | Closed | Dormant) => true,
            (Closed, Open) => true,
            (Dormant, Open) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(ConversationState::Open),
            "bot_handled" => Ok(ConversationState::BotHandled),
            "handed_off" => Ok(ConversationState::HandedOff),
            "closed" => Ok(ConversationState::Closed),
            "dormant" => Ok(ConversationState::Dormant),
            other => Err(format!("unknown conversation state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Purpose of a message; also drives consent checking for automated sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    CustomerInbound,
    BotResponse,
    AutomatedTransactional,
    AutomatedReminder,
    AutomatedReengagement,
    ScheduledPromotional,
    ManualOutbound,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CustomerInbound => "customer_inbound",
            MessageType::BotResponse => "bot_response",
            MessageType::AutomatedTransactional => "automated_transactional",
            MessageType::AutomatedReminder => "automated_reminder",
            MessageType::AutomatedReengagement => "automated_reengagement",
            MessageType::ScheduledPromotional => "scheduled_promotional",
            MessageType::ManualOutbound => "manual_outbound",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "customer_inbound" => Ok(MessageType::CustomerInbound),
            "bot_response" => Ok(MessageType::BotResponse),
            "automated_transactional" => Ok(MessageType::AutomatedTransactional),
            "automated_reminder" => Ok(MessageType::AutomatedReminder),
            "automated_reengagement" => Ok(MessageType::AutomatedReengagement),
            "scheduled_promotional" => Ok(MessageType::ScheduledPromotional),
            "manual_outbound" => Ok(MessageType::ManualOutbound),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A chat session between one customer and one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub state: ConversationState,
    pub channel: String,
    pub last_intent: Option<String>,
    pub intent_confidence: Option<f64>,
    pub low_confidence_count: u32,
    pub last_agent: Option<String>,
    pub handoff_at: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// One communication inside a conversation. Append-only; `seq` preserves
/// total per-conversation arrival order under concurrent appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub direction: Direction,
    pub message_type: MessageType,
    pub text: String,
    pub payload: serde_json::Value,
    pub provider_msg_id: Option<String>,
    pub provider_status: Option<String>,
    pub sent_at: Option<String>,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
    pub failed_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

/// Long-lived soft memory attached 1:1 to a conversation. On expiry the
/// non-fact content is cleared; key facts are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: ConversationId,
    pub current_topic: Option<String>,
    pub key_facts: Vec<String>,
    pub summary: Option<String>,
    pub last_product_viewed: Option<String>,
    pub last_service_viewed: Option<String>,
    pub expires_at: String,
}

impl ConversationContext {
    pub fn is_expired(&self, now: &str) -> bool {
        self.expires_at.as_str() <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_can_only_reopen() {
        assert!(ConversationState::Closed.can_transition_to(ConversationState::Open));
        assert!(!ConversationState::Closed.can_transition_to(ConversationState::HandedOff));
        assert!(!ConversationState::Dormant.can_transition_to(ConversationState::Closed));
    }

    #[test]
    fn state_round_trip() {
        for s in [
            ConversationState::Open,
            ConversationState::BotHandled,
            ConversationState::HandedOff,
            ConversationState::Closed,
            ConversationState::Dormant,
        ] {
            assert_eq!(s.as_str().parse::<ConversationState>().unwrap(), s);
        }
    }
}
