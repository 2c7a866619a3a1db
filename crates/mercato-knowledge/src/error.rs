use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Knowledge entry not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;
