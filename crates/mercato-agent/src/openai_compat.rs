use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use mercato_core::config::LLM_TIMEOUT_SECS;

use crate::provider::{
    cost_per_1k_tokens, ChatMessage, LlmProvider, LlmRequest, LlmResponse, ProviderError,
};

/// Chat client for any OpenAI-compatible `/v1/chat/completions` endpoint.
/// One instance per configured provider slot.
pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatProvider {
    pub fn new(name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            name: name.to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(LLM_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, req: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let body = serde_json::json!({
            "model": req.model,
            "messages": req.messages.iter().map(message_json).collect::<Vec<_>>(),
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5_000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("no choices in response".into()))?;

        let total_tokens = if parsed.usage.total_tokens > 0 {
            parsed.usage.total_tokens
        } else {
            parsed.usage.prompt_tokens + parsed.usage.completion_tokens
        };
        let estimated_cost =
            total_tokens as f64 / 1000.0 * cost_per_1k_tokens(&self.name, &req.model);

        debug!(
            provider = %self.name,
            model = %req.model,
            tokens = total_tokens,
            "chat completion received"
        );

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            total_tokens,
            estimated_cost,
            provider_metadata: serde_json::json!({ "provider": self.name }),
        })
    }
}

fn message_json(m: &ChatMessage) -> serde_json::Value {
    serde_json::json!({
        "role": match m.role {
            crate::provider::Role::System => "system",
            crate::provider::Role::User => "user",
            crate::provider::Role::Assistant => "assistant",
        },
        "content": m.content,
    })
}
