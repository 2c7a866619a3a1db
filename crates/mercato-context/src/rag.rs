//! Multi-source retrieval: enabled sources run in parallel under one global
//! deadline; partial results are synthesised with database results treated
//! as authoritative.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mercato_catalog::CatalogReader;
use mercato_core::config::{RETRIEVAL_DEADLINE_SECS, RETRIEVAL_SOURCE_TIMEOUT_SECS};
use mercato_core::money::Money;
use mercato_core::types::TenantId;
use mercato_knowledge::types::EntryKind;
use mercato_knowledge::KnowledgeStore;
use mercato_tenants::settings::AgentSettings;

/// One retrieved passage from any source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub source: String,
    pub title: String,
    pub content: String,
    pub score: f32,
    /// Structured extras; database passages carry `price_cents` for
    /// conflict detection.
    pub metadata: serde_json::Value,
}

/// Entry in the source manifest consumed by the attribution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub title: String,
}

/// Synthesised retrieval output: database passages are primary, documents
/// supplement, internet results come last.
#[derive(Debug, Clone, Default)]
pub struct RagOutcome {
    pub database: Vec<RetrievedPassage>,
    pub documents: Vec<RetrievedPassage>,
    pub internet: Vec<RetrievedPassage>,
    /// Notes emitted when a conflict was resolved in favour of the database.
    pub synthesis_notes: Vec<String>,
    pub manifest: Vec<SourceRef>,
}

impl RagOutcome {
    pub fn all_passages(&self) -> impl Iterator<Item = &RetrievedPassage> {
        self.database
            .iter()
            .chain(self.documents.iter())
            .chain(self.internet.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_empty() && self.documents.is_empty() && self.internet.is_empty()
    }
}

/// A single retrieval backend.
#[async_trait]
pub trait RetrievalSource: Send + Sync {
    /// Stable source name: "database", "documents" or "internet".
    fn name(&self) -> &str;

    async fn retrieve(&self, query: &str, cap: u32) -> Result<Vec<RetrievedPassage>, String>;
}

/// Orchestrates the enabled sources for one query.
pub struct RagRetriever {
    sources: Vec<Arc<dyn RetrievalSource>>,
    global_deadline: Duration,
    source_timeout: Duration,
}

impl RagRetriever {
    pub fn new(sources: Vec<Arc<dyn RetrievalSource>>) -> Self {
        Self {
            sources,
            global_deadline: Duration::from_secs(RETRIEVAL_DEADLINE_SECS),
            source_timeout: Duration::from_secs(RETRIEVAL_SOURCE_TIMEOUT_SECS),
        }
    }

    pub fn with_deadlines(
        sources: Vec<Arc<dyn RetrievalSource>>,
        global_deadline: Duration,
        source_timeout: Duration,
    ) -> Self {
        Self {
            sources,
            global_deadline,
            source_timeout,
        }
    }

    /// Dispatch the sources enabled in the tenant's settings, bounded by the
    /// global deadline. Sources that fail or time out contribute nothing.
    pub async fn retrieve(&self, query: &str, settings: &AgentSettings) -> RagOutcome {
        let enabled: Vec<&Arc<dyn RetrievalSource>> = self
            .sources
            .iter()
            .filter(|s| match s.name() {
                "documents" => settings.enable_document_retrieval,
                "database" => settings.enable_database_retrieval,
                "internet" => settings.enable_internet_retrieval,
                _ => false,
            })
            .collect();
        if enabled.is_empty() {
            return RagOutcome::default();
        }

        let tasks = enabled.iter().map(|source| {
            let source = Arc::clone(source);
            let query = query.to_string();
            let cap = settings.source_cap(source.name());
            let timeout = self.source_timeout;
            async move {
                let name = source.name().to_string();
                match tokio::time::timeout(timeout, source.retrieve(&query, cap)).await {
                    Ok(Ok(passages)) => (name, passages),
                    Ok(Err(e)) => {
                        warn!(source = %name, error = %e, "retrieval source failed");
                        (name, Vec::new())
                    }
                    Err(_) => {
                        warn!(source = %name, "retrieval source timed out");
                        (name, Vec::new())
                    }
                }
            }
        });

        let results = match tokio::time::timeout(self.global_deadline, join_all(tasks)).await {
            Ok(results) => results,
            Err(_) => {
                warn!("retrieval deadline exceeded, synthesising nothing");
                return RagOutcome::default();
            }
        };

        let mut outcome = RagOutcome::default();
        for (name, passages) in results {
            match name.as_str() {
                "database" => outcome.database = passages,
                "documents" => outcome.documents = passages,
                "internet" => outcome.internet = passages,
                _ => {}
            }
        }
        synthesize(&mut outcome);
        info!(
            database = outcome.database.len(),
            documents = outcome.documents.len(),
            internet = outcome.internet.len(),
            notes = outcome.synthesis_notes.len(),
            "retrieval complete"
        );
        outcome
    }
}

/// Database results are authoritative. A supplementary passage whose title
/// matches a database passage but disagrees on price is dropped in favour of
/// the database value, with a synthesis note.
fn synthesize(outcome: &mut RagOutcome) {
    let db_prices: Vec<(String, i64)> = outcome
        .database
        .iter()
        .filter_map(|p| {
            let cents = p.metadata.get("price_cents")?.as_i64()?;
            Some((p.title.to_lowercase(), cents))
        })
        .collect();

    let mut notes = Vec::new();
    let mut drop_conflicting = |passages: &mut Vec<RetrievedPassage>| {
        passages.retain(|p| {
            let Some(cents) = p.metadata.get("price_cents").and_then(|v| v.as_i64()) else {
                return true;
            };
            let title = p.title.to_lowercase();
            match db_prices.iter().find(|(t, _)| *t == title) {
                Some((_, db_cents)) if *db_cents != cents => {
                    notes.push(format!(
                        "Conflicting price for '{}': kept catalog value {} over {} from {}",
                        p.title,
                        Money::from_cents(*db_cents),
                        Money::from_cents(cents),
                        p.source,
                    ));
                    false
                }
                _ => true,
            }
        });
    };
    drop_conflicting(&mut outcome.documents);
    drop_conflicting(&mut outcome.internet);
    outcome.synthesis_notes = notes;

    outcome.manifest = outcome
        .all_passages()
        .map(|p| SourceRef {
            source: p.source.clone(),
            title: p.title.clone(),
        })
        .collect();
}

// ── concrete sources ─────────────────────────────────────────────────────────

/// Authoritative source: the tenant's own catalog.
pub struct DatabaseSource {
    tenant_id: TenantId,
    reader: Arc<CatalogReader>,
}

impl DatabaseSource {
    pub fn new(tenant_id: TenantId, reader: Arc<CatalogReader>) -> Self {
        Self { tenant_id, reader }
    }
}

#[async_trait]
impl RetrievalSource for DatabaseSource {
    fn name(&self) -> &str {
        "database"
    }

    async fn retrieve(&self, query: &str, cap: u32) -> Result<Vec<RetrievedPassage>, String> {
        let per_kind = (cap as usize / 2).max(1);
        let (products, services) = self
            .reader
            .catalog_slice(&self.tenant_id, Some(query), per_kind)
            .map_err(|e| e.to_string())?;

        let mut passages = Vec::new();
        for product in products {
            passages.push(RetrievedPassage {
                source: "database".into(),
                title: product.title.clone(),
                content: format!(
                    "{} — {} {} ({} in stock). {}",
                    product.title,
                    product.currency,
                    product.price,
                    product.stock,
                    product.description.as_deref().unwrap_or(""),
                ),
                score: 1.0,
                metadata: serde_json::json!({
                    "id": product.id,
                    "price_cents": product.price.cents,
                    "stock": product.stock,
                }),
            });
        }
        for service in services {
            passages.push(RetrievedPassage {
                source: "database".into(),
                title: service.title.clone(),
                content: format!(
                    "{} — {} {} ({} min). {}",
                    service.title,
                    service.currency,
                    service.price,
                    service.duration_minutes,
                    service.description.as_deref().unwrap_or(""),
                ),
                score: 1.0,
                metadata: serde_json::json!({
                    "id": service.id,
                    "price_cents": service.price.cents,
                }),
            });
        }
        Ok(passages)
    }
}

/// Supplementary source: uploaded documents stored as knowledge entries.
pub struct DocumentSource {
    tenant_id: TenantId,
    store: Arc<KnowledgeStore>,
}

impl DocumentSource {
    pub fn new(tenant_id: TenantId, store: Arc<KnowledgeStore>) -> Self {
        Self { tenant_id, store }
    }
}

#[async_trait]
impl RetrievalSource for DocumentSource {
    fn name(&self) -> &str {
        "documents"
    }

    async fn retrieve(&self, query: &str, cap: u32) -> Result<Vec<RetrievedPassage>, String> {
        let results = self
            .store
            .search(
                &self.tenant_id,
                query,
                Some(&[EntryKind::Procedure, EntryKind::Policy, EntryKind::General]),
                cap as usize,
                0.5,
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(results
            .into_iter()
            .map(|scored| RetrievedPassage {
                source: "documents".into(),
                title: scored.entry.title,
                content: scored.entry.content,
                score: scored.score,
                metadata: serde_json::json!({ "id": scored.entry.id }),
            })
            .collect())
    }
}

/// Lowest-priority supplementary source: web search for product enrichment.
pub struct InternetSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl InternetSource {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(RETRIEVAL_SOURCE_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl RetrievalSource for InternetSource {
    fn name(&self) -> &str {
        "internet"
    }

    async fn retrieve(&self, query: &str, cap: u32) -> Result<Vec<RetrievedPassage>, String> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("api_key", &self.api_key)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("search API returned {}", response.status()));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let results = body
            .get("organic_results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(results
            .iter()
            .take(cap as usize)
            .filter_map(|item| {
                Some(RetrievedPassage {
                    source: "internet".into(),
                    title: item.get("title")?.as_str()?.to_string(),
                    content: item
                        .get("snippet")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    score: 0.5,
                    metadata: serde_json::json!({
                        "url": item.get("link").and_then(|v| v.as_str()),
                    }),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource {
        name: &'static str,
        passages: Vec<RetrievedPassage>,
        delay: Duration,
    }

    #[async_trait]
    impl RetrievalSource for StaticSource {
        fn name(&self) -> &str {
            self.name
        }
        async fn retrieve(&self, _query: &str, cap: u32) -> Result<Vec<RetrievedPassage>, String> {
            tokio::time::sleep(self.delay).await;
            Ok(self.passages.iter().take(cap as usize).cloned().collect())
        }
    }

    fn passage(source: &str, title: &str, price_cents: Option<i64>) -> RetrievedPassage {
        RetrievedPassage {
            source: source.to_string(),
            title: title.to_string(),
            content: format!("{title} content"),
            score: 1.0,
            metadata: price_cents
                .map(|c| serde_json::json!({ "price_cents": c }))
                .unwrap_or(serde_json::json!({})),
        }
    }

    fn settings_all_sources() -> AgentSettings {
        AgentSettings {
            enable_document_retrieval: true,
            enable_database_retrieval: true,
            enable_internet_retrieval: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn price_conflicts_resolved_in_favour_of_database() {
        let retriever = RagRetriever::new(vec![
            Arc::new(StaticSource {
                name: "database",
                passages: vec![passage("database", "Blue Shirt", Some(2999))],
                delay: Duration::ZERO,
            }),
            Arc::new(StaticSource {
                name: "internet",
                passages: vec![passage("internet", "Blue Shirt", Some(3499))],
                delay: Duration::ZERO,
            }),
        ]);

        let outcome = retriever.retrieve("blue shirt", &settings_all_sources()).await;
        assert_eq!(outcome.database.len(), 1);
        assert!(outcome.internet.is_empty());
        assert_eq!(outcome.synthesis_notes.len(), 1);
        assert!(outcome.synthesis_notes[0].contains("29.99"));
    }

    #[tokio::test]
    async fn disabled_sources_are_not_dispatched() {
        let retriever = RagRetriever::new(vec![Arc::new(StaticSource {
            name: "internet",
            passages: vec![passage("internet", "thing", None)],
            delay: Duration::ZERO,
        })]);
        let settings = AgentSettings {
            enable_internet_retrieval: false,
            ..Default::default()
        };
        let outcome = retriever.retrieve("thing", &settings).await;
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn slow_source_contributes_nothing() {
        let retriever = RagRetriever::with_deadlines(
            vec![
                Arc::new(StaticSource {
                    name: "database",
                    passages: vec![passage("database", "fast", None)],
                    delay: Duration::ZERO,
                }),
                Arc::new(StaticSource {
                    name: "documents",
                    passages: vec![passage("documents", "slow", None)],
                    delay: Duration::from_millis(500),
                }),
            ],
            Duration::from_secs(2),
            Duration::from_millis(50),
        );

        let outcome = retriever.retrieve("q", &settings_all_sources()).await;
        assert_eq!(outcome.database.len(), 1);
        assert!(outcome.documents.is_empty());
    }

    #[tokio::test]
    async fn manifest_covers_all_kept_passages() {
        let retriever = RagRetriever::new(vec![
            Arc::new(StaticSource {
                name: "database",
                passages: vec![passage("database", "A", None)],
                delay: Duration::ZERO,
            }),
            Arc::new(StaticSource {
                name: "documents",
                passages: vec![passage("documents", "B", None)],
                delay: Duration::ZERO,
            }),
        ]);
        let outcome = retriever.retrieve("q", &settings_all_sources()).await;
        let titles: Vec<_> = outcome.manifest.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }
}
