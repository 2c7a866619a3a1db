use std::collections::HashMap;
use std::sync::Arc;

use mercato_core::config::ProvidersConfig;

use crate::openai_compat::OpenAiCompatProvider;
use crate::provider::LlmProvider;

/// Process-wide map of provider id → client, built from configuration.
///
/// Tenant credential blobs override the global entries: a tenant blob of the
/// form `{ "providers": { "openai": { "api_key": "...", "base_url": "..." } } }`
/// yields tenant-specific clients from [`ProviderRegistry::for_tenant`].
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for entry in &config.entries {
            providers.insert(
                entry.id.clone(),
                Arc::new(OpenAiCompatProvider::new(
                    &entry.id,
                    &entry.base_url,
                    &entry.api_key,
                )),
            );
        }
        Self { providers }
    }

    /// Registry with explicit providers; used for tests and custom wiring.
    pub fn from_providers(list: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers: list
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
        }
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider).cloned()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Overlay tenant credentials on top of the global registry.
    pub fn for_tenant(&self, tenant_credentials: &serde_json::Value) -> ProviderRegistry {
        let mut providers = self.providers.clone();
        if let Some(overrides) = tenant_credentials
            .get("providers")
            .and_then(|v| v.as_object())
        {
            for (id, entry) in overrides {
                let api_key = entry.get("api_key").and_then(|v| v.as_str());
                let base_url = entry.get("base_url").and_then(|v| v.as_str());
                if let (Some(api_key), Some(base_url)) = (api_key, base_url) {
                    providers.insert(
                        id.clone(),
                        Arc::new(OpenAiCompatProvider::new(id, base_url, api_key)),
                    );
                }
            }
        }
        ProviderRegistry { providers }
    }
}
