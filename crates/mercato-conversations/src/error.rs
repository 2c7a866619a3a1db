use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message text exceeds {max} characters (got {len})")]
    TextTooLong { len: usize, max: usize },

    #[error("Duplicate provider message id: {0}")]
    DuplicateProviderMessageId(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Delivery state may only advance: {0}")]
    DeliveryNotMonotonic(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConversationError>;
