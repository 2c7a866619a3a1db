use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Actor is not a member of this tenant")]
    NotAMember,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transactional consent cannot be revoked")]
    TransactionalConsentImmutable,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TenantError>;
