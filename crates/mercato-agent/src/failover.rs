//! Failover execution: try the primary (provider, model), then walk the
//! fallback chain. Attempts run sequentially — never in parallel — to avoid
//! duplicate billing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use mercato_core::config::LLM_TIMEOUT_SECS;

use crate::health::HealthTracker;
use crate::provider::{LlmRequest, LlmResponse, ProviderError};
use crate::registry::ProviderRegistry;

/// Ledger line for one provider attempt; every attempt (success or failure)
/// becomes a `ProviderUsage` row downstream.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub was_failover: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub response_tokens: Option<(u32, u32, u32)>,
    pub estimated_cost: f64,
}

/// Outcome of a successful failover run.
#[derive(Debug)]
pub struct FailoverOutcome {
    pub response: LlmResponse,
    pub provider: String,
    pub model: String,
    pub was_failover: bool,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, thiserror::Error)]
#[error("all providers failed: {last_error}")]
pub struct AllProvidersFailed {
    pub last_error: String,
    pub attempts: Vec<AttemptRecord>,
}

pub struct FailoverRunner {
    health: Arc<HealthTracker>,
    attempt_timeout: Duration,
}

impl FailoverRunner {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self {
            health,
            attempt_timeout: Duration::from_secs(LLM_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(health: Arc<HealthTracker>, attempt_timeout: Duration) -> Self {
        Self {
            health,
            attempt_timeout,
        }
    }

    /// Execute the request against the primary slot, then the fallback chain.
    ///
    /// Unhealthy providers (>50% failures in the observation window) are
    /// skipped. Each attempt is bounded by the per-attempt timeout; failures
    /// are recorded against provider health and the run continues. The first
    /// success wins.
    pub async fn execute(
        &self,
        registry: &ProviderRegistry,
        primary: (&str, &str),
        fallback_chain: &[(String, String)],
        request: &LlmRequest,
    ) -> Result<FailoverOutcome, AllProvidersFailed> {
        let mut attempts_list: Vec<(String, String)> =
            vec![(primary.0.to_string(), primary.1.to_string())];
        for (provider, model) in fallback_chain {
            if (provider.as_str(), model.as_str()) != primary {
                attempts_list.push((provider.clone(), model.clone()));
            }
        }

        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut last_error = String::from("no provider attempted");

        for (attempt_num, (provider_name, model_name)) in attempts_list.iter().enumerate() {
            let was_failover = attempt_num > 0;

            if !self.health.is_healthy(provider_name) {
                warn!(provider = %provider_name, "provider marked unhealthy, skipping");
                continue;
            }

            let Some(provider) = registry.get(provider_name) else {
                warn!(provider = %provider_name, "provider not configured, skipping");
                continue;
            };

            let mut attempt_request = request.clone();
            attempt_request.model = model_name.clone();

            let started = Instant::now();
            let result =
                tokio::time::timeout(self.attempt_timeout, provider.generate(&attempt_request))
                    .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(Ok(response)) => {
                    self.health.record_success(provider_name);
                    if was_failover {
                        info!(
                            provider = %provider_name,
                            model = %model_name,
                            failed_attempts = attempt_num,
                            "failover succeeded"
                        );
                    }
                    records.push(AttemptRecord {
                        provider: provider_name.clone(),
                        model: model_name.clone(),
                        success: true,
                        was_failover,
                        latency_ms,
                        error: None,
                        response_tokens: Some((
                            response.input_tokens,
                            response.output_tokens,
                            response.total_tokens,
                        )),
                        estimated_cost: response.estimated_cost,
                    });
                    return Ok(FailoverOutcome {
                        response,
                        provider: provider_name.clone(),
                        model: model_name.clone(),
                        was_failover,
                        attempts: records,
                    });
                }
                Ok(Err(e)) => {
                    self.health.record_failure(provider_name);
                    warn!(provider = %provider_name, model = %model_name, error = %e, "provider attempt failed");
                    last_error = e.to_string();
                    records.push(AttemptRecord {
                        provider: provider_name.clone(),
                        model: model_name.clone(),
                        success: false,
                        was_failover,
                        latency_ms,
                        error: Some(last_error.clone()),
                        response_tokens: None,
                        estimated_cost: 0.0,
                    });
                }
                Err(_) => {
                    self.health.record_failure(provider_name);
                    let e = ProviderError::Timeout {
                        ms: self.attempt_timeout.as_millis() as u64,
                    };
                    warn!(provider = %provider_name, model = %model_name, "provider attempt timed out");
                    last_error = e.to_string();
                    records.push(AttemptRecord {
                        provider: provider_name.clone(),
                        model: model_name.clone(),
                        success: false,
                        was_failover,
                        latency_ms,
                        error: Some(last_error.clone()),
                        response_tokens: None,
                        estimated_cost: 0.0,
                    });
                }
            }
        }

        Err(AllProvidersFailed {
            last_error,
            attempts: records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, LlmProvider, Role};
    use async_trait::async_trait;

    struct AlwaysFail(&'static str);

    #[async_trait]
    impl LlmProvider for AlwaysFail {
        fn name(&self) -> &str {
            self.0
        }
        async fn generate(&self, _req: &LlmRequest) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::Unavailable("intentional failure".into()))
        }
    }

    struct AlwaysOk(&'static str);

    #[async_trait]
    impl LlmProvider for AlwaysOk {
        fn name(&self) -> &str {
            self.0
        }
        async fn generate(&self, req: &LlmRequest) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                content: "ok".into(),
                finish_reason: "stop".into(),
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                estimated_cost: 0.001,
                provider_metadata: serde_json::json!({ "model": req.model }),
            })
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            model: "primary-model".into(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hello".into(),
            }],
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn falls_back_to_second_provider() {
        let registry = ProviderRegistry::from_providers(vec![
            Arc::new(AlwaysFail("openai")),
            Arc::new(AlwaysOk("gemini")),
        ]);
        let runner = FailoverRunner::new(HealthTracker::new());

        let outcome = runner
            .execute(
                &registry,
                ("openai", "gpt-4o"),
                &[("gemini".into(), "gemini-1.5-pro".into())],
                &request(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.provider, "gemini");
        assert_eq!(outcome.model, "gemini-1.5-pro");
        assert!(outcome.was_failover);
        // Both attempts are recorded: the failed primary and the success.
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
    }

    #[tokio::test]
    async fn primary_success_is_not_failover() {
        let registry = ProviderRegistry::from_providers(vec![Arc::new(AlwaysOk("openai"))]);
        let runner = FailoverRunner::new(HealthTracker::new());

        let outcome = runner
            .execute(&registry, ("openai", "gpt-4o"), &[], &request())
            .await
            .unwrap();
        assert!(!outcome.was_failover);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn all_failures_surface_last_error() {
        let registry = ProviderRegistry::from_providers(vec![
            Arc::new(AlwaysFail("openai")),
            Arc::new(AlwaysFail("gemini")),
        ]);
        let runner = FailoverRunner::new(HealthTracker::new());

        let err = runner
            .execute(
                &registry,
                ("openai", "gpt-4o"),
                &[("gemini".into(), "gemini-1.5-pro".into())],
                &request(),
            )
            .await
            .unwrap_err();
        assert!(err.last_error.contains("intentional failure"));
        assert_eq!(err.attempts.len(), 2);
    }

    #[tokio::test]
    async fn unhealthy_provider_is_skipped() {
        let registry = ProviderRegistry::from_providers(vec![
            Arc::new(AlwaysFail("openai")),
            Arc::new(AlwaysOk("gemini")),
        ]);
        let health = HealthTracker::new();
        health.record_failure("openai");
        let runner = FailoverRunner::new(Arc::clone(&health));

        let outcome = runner
            .execute(
                &registry,
                ("openai", "gpt-4o"),
                &[("gemini".into(), "gemini-1.5-pro".into())],
                &request(),
            )
            .await
            .unwrap();
        // The unhealthy primary was never attempted.
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.provider, "gemini");
    }

    #[tokio::test]
    async fn chain_deduplicates_primary() {
        let registry = ProviderRegistry::from_providers(vec![Arc::new(AlwaysFail("openai"))]);
        let runner = FailoverRunner::new(HealthTracker::new());

        let err = runner
            .execute(
                &registry,
                ("openai", "gpt-4o"),
                &[("openai".into(), "gpt-4o".into())],
                &request(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 1);
    }
}
