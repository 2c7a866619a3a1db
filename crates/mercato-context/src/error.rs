use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Conversation store error: {0}")]
    Conversations(#[from] mercato_conversations::ConversationError),

    #[error("Knowledge store error: {0}")]
    Knowledge(#[from] mercato_knowledge::KnowledgeError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] mercato_catalog::CatalogError),

    #[error("Retrieval source error ({source_name}): {reason}")]
    Retrieval { source_name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ContextError>;
