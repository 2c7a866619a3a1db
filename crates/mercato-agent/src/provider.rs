use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Request to a language-model provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Response from a language-model provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub finish_reason: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    /// Estimated cost in USD for this call.
    pub estimated_cost: f64,
    pub provider_metadata: serde_json::Value,
}

/// Common interface for all LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging, health tracking and usage rows.
    fn name(&self) -> &str;

    /// Send a chat request and wait for the full response.
    async fn generate(&self, req: &LlmRequest) -> Result<LlmResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Transient failures trigger failover to the next slot; permanent ones
    /// (auth, bad request) still move on but are reported differently.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) => false,
        }
    }
}

/// Cost per 1K tokens (averaged input/output) for known models; unknown
/// models cost 0 until a pricing entry is added.
pub fn cost_per_1k_tokens(provider: &str, model: &str) -> f64 {
    match (provider, model) {
        ("openai", "gpt-4o") => 0.00625,
        ("openai", "gpt-4o-mini") => 0.000375,
        ("openai", "o1-preview") => 0.0375,
        ("openai", "o1-mini") => 0.0075,
        ("gemini", "gemini-1.5-pro") | ("gemini", "gemini-1.5-pro-latest") => 0.003125,
        ("gemini", "gemini-1.5-flash") | ("gemini", "gemini-1.5-flash-latest") => 0.0001875,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(ProviderError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(ProviderError::Timeout { ms: 30_000 }.is_transient());
    }

    #[test]
    fn known_model_pricing() {
        assert!(cost_per_1k_tokens("openai", "gpt-4o") > 0.0);
        assert_eq!(cost_per_1k_tokens("acme", "mystery-1"), 0.0);
    }
}
