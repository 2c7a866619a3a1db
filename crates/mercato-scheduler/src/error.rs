use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduled message not found: {0}")]
    NotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Scheduled time must be in the future")]
    ScheduledInPast,

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Message must belong to the same tenant as scheduled message")]
    TenantMismatch,

    #[error("Campaign quota exceeded: {used}/{quota} this month")]
    QuotaExceeded { used: u32, quota: u32 },

    #[error("Tenant store error: {0}")]
    Tenant(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation error: {0}")]
    Conversation(#[from] mercato_conversations::ConversationError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
