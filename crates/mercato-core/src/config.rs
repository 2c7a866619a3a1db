use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Turn and I/O budgets (milliseconds unless noted).
pub const TURN_BUDGET_SECS: u64 = 60;
pub const LLM_TIMEOUT_SECS: u64 = 30;
pub const EMBEDDING_TIMEOUT_SECS: u64 = 10;
pub const RETRIEVAL_SOURCE_TIMEOUT_SECS: u64 = 3;
pub const RETRIEVAL_DEADLINE_SECS: u64 = 5;
pub const CHANNEL_SEND_TIMEOUT_SECS: u64 = 15;
pub const SCHEDULER_POLL_SECS: u64 = 30;

/// Burst harmonization: maximum inter-arrival gap grouping messages into one turn.
pub const BURST_WINDOW_SECS: i64 = 3;
/// Flush timer armed after the latest enqueue.
pub const FLUSH_DELAY_SECS: u64 = 5;

/// Context assembly token budget (estimate = ceil(chars / 4)).
pub const CONTEXT_TOKEN_BUDGET: usize = 100_000;

/// Maximum inbound/outbound message text length in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Top-level config (mercato.toml + MERCATO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MercatoConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl Default for MercatoConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            providers: ProvidersConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-process secret for webhook HMAC verification.
    pub webhook_secret: Option<String>,
    /// Requests per minute allowed per user/IP on the admin API.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            webhook_secret: None,
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
        }
    }
}

/// Global provider credentials. Tenants may carry their own credential blobs
/// which override these process-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub entries: Vec<ProviderEntry>,
}

/// One OpenAI-compatible provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider identifier used by routing tables (e.g. "openai", "gemini").
    pub id: String,
    pub api_key: String,
    /// Base URL without trailing slash.
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Optional API key for the internet search source.
    pub search_api_key: Option<String>,
    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_api_key: None,
            search_base_url: default_search_base_url(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8460
}
fn default_rate_limit() -> u32 {
    120
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mercato/mercato.db", home)
}
fn default_embedding_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_search_base_url() -> String {
    "https://serpapi.com".to_string()
}

impl MercatoConfig {
    /// Load config from a TOML file with MERCATO_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MercatoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MERCATO_").split("_"))
            .extract()
            .map_err(|e| crate::error::MercatoError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mercato/mercato.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MercatoConfig::default();
        assert_eq!(cfg.gateway.port, 8460);
        assert!(cfg.database.path.ends_with("mercato.db"));
        assert!(cfg.providers.entries.is_empty());
    }
}
