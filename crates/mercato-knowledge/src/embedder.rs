use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use mercato_core::config::{EmbeddingConfig, EMBEDDING_TIMEOUT_SECS};

use crate::error::KnowledgeError;

/// Dense-vector embedding service used by semantic search.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, KnowledgeError>;
}

/// Embedding input is truncated to roughly the model's token limit
/// (estimate: 4 chars per token).
const MAX_EMBED_CHARS: usize = 8191 * 4;

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    /// Returns `None` when no API key is configured; callers then rely on
    /// the keyword fallback.
    pub fn from_config(config: &EmbeddingConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(EMBEDDING_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
            base_url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, KnowledgeError> {
        let input: String = if text.len() > MAX_EMBED_CHARS {
            warn!(len = text.len(), "truncating embedding input");
            text.chars().take(MAX_EMBED_CHARS).collect()
        } else {
            text.to_string()
        };

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": input }))
            .send()
            .await
            .map_err(|e| KnowledgeError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KnowledgeError::Embedding(format!(
                "embedding API returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KnowledgeError::Embedding(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| KnowledgeError::Embedding("empty embedding response".into()))
    }
}

/// Cosine similarity normalised from [-1, 1] to [0, 1] via (cos + 1) / 2.
pub fn normalized_cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    let cos = dot / (mag_a * mag_b);
    (cos + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.5, 0.2, -0.3];
        assert!((normalized_cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!(normalized_cosine(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_half() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((normalized_cosine(&a, &b) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_score_zero() {
        assert_eq!(normalized_cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
