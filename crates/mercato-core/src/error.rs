use thiserror::Error;

/// Top-level failure taxonomy. Names describe the failure, not a programming
/// construct; each maps to a stable wire code and an HTTP status.
#[derive(Debug, Error)]
pub enum MercatoError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Not authorized: {reason}")]
    NotAuthorized { reason: String },

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Transient provider error ({provider}): {reason}")]
    TransientProvider { provider: String, reason: String },

    #[error("Permanent provider error ({provider}): {reason}")]
    PermanentProvider { provider: String, reason: String },

    #[error("All providers failed: {last_error}")]
    AllProvidersFailed { last_error: String },

    #[error("Response failed grounding: {issues:?}")]
    GroundingFailure { issues: Vec<String> },

    #[error("Turn budget exceeded after {ms}ms")]
    BudgetExceeded { ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MercatoError {
    /// Short error code string for the canonical API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            MercatoError::InputInvalid(_) => "INPUT_INVALID",
            MercatoError::NotAuthenticated(_) => "NOT_AUTHENTICATED",
            MercatoError::SignatureInvalid(_) => "SIGNATURE_INVALID",
            MercatoError::NotAuthorized { .. } => "NOT_AUTHORIZED",
            MercatoError::UnknownTenant(_) => "UNKNOWN_TENANT",
            MercatoError::NotFound { .. } => "NOT_FOUND",
            MercatoError::Conflict(_) => "CONFLICT",
            MercatoError::RateLimited { .. } => "RATE_LIMITED",
            MercatoError::TransientProvider { .. } => "PROVIDER_TRANSIENT",
            MercatoError::PermanentProvider { .. } => "PROVIDER_PERMANENT",
            MercatoError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
            MercatoError::GroundingFailure { .. } => "GROUNDING_FAILURE",
            MercatoError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            MercatoError::Config(_) => "CONFIG_ERROR",
            MercatoError::Database(_) => "DATABASE_ERROR",
            MercatoError::Serialization(_) => "SERIALIZATION_ERROR",
            MercatoError::Io(_) => "IO_ERROR",
            MercatoError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status used by the admin API for this failure class.
    pub fn http_status(&self) -> u16 {
        match self {
            MercatoError::InputInvalid(_) => 400,
            MercatoError::NotAuthenticated(_) | MercatoError::SignatureInvalid(_) => 401,
            MercatoError::NotAuthorized { .. } => 403,
            MercatoError::UnknownTenant(_) | MercatoError::NotFound { .. } => 404,
            MercatoError::Conflict(_) => 409,
            MercatoError::RateLimited { .. } => 429,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, MercatoError>;
