use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mercato_core::json_guard::validate_json_field;
use mercato_core::types::TenantId;

use crate::db::init_db;
use crate::embedder::{normalized_cosine, Embedder};
use crate::error::{KnowledgeError, Result};
use crate::types::*;

/// Default minimum similarity for a semantic hit.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.7;

/// Tenant-scoped knowledge base with semantic search.
///
/// Search results are cached under versioned keys: every write bumps the
/// tenant's version counter, so stale cache entries become unreachable
/// without explicit invalidation.
pub struct KnowledgeStore {
    db: Arc<Mutex<Connection>>,
    embedder: Option<Arc<dyn Embedder>>,
    search_cache: DashMap<String, Vec<(String, f32)>>,
    tenant_versions: DashMap<String, u64>,
}

impl KnowledgeStore {
    pub fn new(conn: Connection, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            embedder,
            search_cache: DashMap::new(),
            tenant_versions: DashMap::new(),
        })
    }

    // ── CRUD ─────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_entry(
        &self,
        tenant_id: &TenantId,
        kind: EntryKind,
        title: &str,
        content: &str,
        category: Option<&str>,
        keywords: &[&str],
        metadata: serde_json::Value,
        priority: u8,
    ) -> Result<KnowledgeEntry> {
        if priority > 100 {
            return Err(KnowledgeError::Validation(
                "priority must be between 0 and 100".into(),
            ));
        }
        if title.trim().is_empty() || content.trim().is_empty() {
            return Err(KnowledgeError::Validation(
                "title and content must not be empty".into(),
            ));
        }
        validate_json_field(&metadata, "metadata")
            .map_err(|e| KnowledgeError::Validation(e.to_string()))?;

        let embedding = self.generate_embedding(title, content).await;
        let now = chrono::Utc::now().to_rfc3339();
        let entry = KnowledgeEntry {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.clone(),
            kind,
            title: title.to_string(),
            content: content.to_string(),
            category: category.map(String::from),
            keywords: keywords.join(", "),
            embedding,
            metadata,
            priority,
            active: true,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
        };

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO knowledge_entries
                 (id, tenant_id, kind, title, content, category, keywords, embedding,
                  metadata, priority, active, version, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,1,1,?11,?11)",
                rusqlite::params![
                    entry.id,
                    tenant_id.as_str(),
                    kind.as_str(),
                    entry.title,
                    entry.content,
                    entry.category,
                    entry.keywords,
                    entry
                        .embedding
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&entry.metadata)?,
                    priority as i64,
                    entry.created_at,
                ],
            )?;
        }
        self.bump_version(tenant_id);
        info!(tenant_id = %tenant_id, entry_id = %entry.id, kind = kind.as_str(), "knowledge entry created");
        Ok(entry)
    }

    pub fn get_entry(&self, tenant_id: &TenantId, id: &str) -> Result<KnowledgeEntry> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, kind, title, content, category, keywords, embedding,
                    metadata, priority, active, version, created_at, updated_at
             FROM knowledge_entries WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id.as_str(), id],
            row_to_entry,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => KnowledgeError::NotFound(id.to_string()),
            other => KnowledgeError::Database(other),
        })
    }

    /// Update an entry, regenerating the embedding when title or content
    /// changed and bumping the version either way.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_entry(
        &self,
        tenant_id: &TenantId,
        id: &str,
        title: Option<&str>,
        content: Option<&str>,
        category: Option<&str>,
        keywords: Option<&[&str]>,
        metadata: Option<serde_json::Value>,
        priority: Option<u8>,
    ) -> Result<KnowledgeEntry> {
        let mut entry = self.get_entry(tenant_id, id)?;

        let regenerate = title.is_some() || content.is_some();
        if let Some(t) = title {
            entry.title = t.to_string();
        }
        if let Some(c) = content {
            entry.content = c.to_string();
        }
        if let Some(c) = category {
            entry.category = Some(c.to_string());
        }
        if let Some(k) = keywords {
            entry.keywords = k.join(", ");
        }
        if let Some(m) = metadata {
            validate_json_field(&m, "metadata")
                .map_err(|e| KnowledgeError::Validation(e.to_string()))?;
            entry.metadata = m;
        }
        if let Some(p) = priority {
            if p > 100 {
                return Err(KnowledgeError::Validation(
                    "priority must be between 0 and 100".into(),
                ));
            }
            entry.priority = p;
        }

        if regenerate {
            entry.embedding = self.generate_embedding(&entry.title, &entry.content).await;
        }
        entry.version += 1;
        entry.updated_at = chrono::Utc::now().to_rfc3339();

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE knowledge_entries
                 SET title=?3, content=?4, category=?5, keywords=?6, embedding=?7,
                     metadata=?8, priority=?9, version=?10, updated_at=?11
                 WHERE tenant_id=?1 AND id=?2",
                rusqlite::params![
                    tenant_id.as_str(),
                    id,
                    entry.title,
                    entry.content,
                    entry.category,
                    entry.keywords,
                    entry
                        .embedding
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&entry.metadata)?,
                    entry.priority as i64,
                    entry.version,
                    entry.updated_at,
                ],
            )?;
        }
        self.bump_version(tenant_id);
        debug!(entry_id = id, version = entry.version, regenerated = regenerate, "knowledge entry updated");
        Ok(entry)
    }

    /// Soft delete: flips `active` off and bumps the version.
    pub fn delete_entry(&self, tenant_id: &TenantId, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE knowledge_entries
             SET active = 0, version = version + 1, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id.as_str(), id, chrono::Utc::now().to_rfc3339()],
        )?;
        drop(db);
        if n == 0 {
            return Err(KnowledgeError::NotFound(id.to_string()));
        }
        self.bump_version(tenant_id);
        info!(tenant_id = %tenant_id, entry_id = id, "knowledge entry soft-deleted");
        Ok(())
    }

    // ── search ───────────────────────────────────────────────────────────────

    /// Semantic search over active entries; scores are normalised cosine in
    /// [0, 1], sorted by (similarity desc, priority desc). Falls back to
    /// keyword matching when no embedding is available.
    pub async fn search(
        &self,
        tenant_id: &TenantId,
        query: &str,
        kinds: Option<&[EntryKind]>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredEntry>> {
        let cache_key = self.cache_key(tenant_id, query, kinds, limit, min_similarity);
        if let Some(hit) = self.search_cache.get(&cache_key) {
            debug!(tenant_id = %tenant_id, "search cache hit");
            let mut out = Vec::with_capacity(hit.len());
            for (id, score) in hit.iter() {
                if let Ok(entry) = self.get_entry(tenant_id, id) {
                    out.push(ScoredEntry {
                        entry,
                        score: *score,
                    });
                }
            }
            return Ok(out);
        }

        let query_embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "query embedding failed, falling back to keyword search");
                    None
                }
            },
            None => None,
        };

        let entries = self.load_active(tenant_id, kinds)?;
        let mut results: Vec<ScoredEntry> = match query_embedding {
            Some(qv) => entries
                .into_iter()
                .filter_map(|entry| {
                    let score = normalized_cosine(&qv, entry.embedding.as_deref()?);
                    (score >= min_similarity).then_some(ScoredEntry { entry, score })
                })
                .collect(),
            None => keyword_search(entries, query),
        };

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.entry.priority.cmp(&a.entry.priority))
        });
        results.truncate(limit);

        self.search_cache.insert(
            cache_key,
            results
                .iter()
                .map(|r| (r.entry.id.clone(), r.score))
                .collect(),
        );
        Ok(results)
    }

    fn load_active(
        &self,
        tenant_id: &TenantId,
        kinds: Option<&[EntryKind]>,
    ) -> Result<Vec<KnowledgeEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, kind, title, content, category, keywords, embedding,
                    metadata, priority, active, version, created_at, updated_at
             FROM knowledge_entries WHERE tenant_id = ?1 AND active = 1",
        )?;
        let rows = stmt.query_map([tenant_id.as_str()], row_to_entry)?;
        let mut entries: Vec<KnowledgeEntry> = rows.filter_map(|r| r.ok()).collect();
        if let Some(kinds) = kinds {
            entries.retain(|e| kinds.contains(&e.kind));
        }
        Ok(entries)
    }

    async fn generate_embedding(&self, title: &str, content: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let text = format!("{title}\n\n{content}");
        match embedder.embed(&text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "embedding generation failed, storing entry without vector");
                None
            }
        }
    }

    fn cache_key(
        &self,
        tenant_id: &TenantId,
        query: &str,
        kinds: Option<&[EntryKind]>,
        limit: usize,
        min_similarity: f32,
    ) -> String {
        let version = self
            .tenant_versions
            .get(tenant_id.as_str())
            .map(|v| *v)
            .unwrap_or(0);
        let mut kind_names: Vec<&str> = kinds
            .map(|ks| ks.iter().map(|k| k.as_str()).collect())
            .unwrap_or_default();
        kind_names.sort_unstable();
        let query_head: String = query.chars().take(100).collect();
        format!(
            "{}:{}:{}:{}:{}:{}",
            tenant_id.as_str(),
            version,
            kind_names.join(","),
            limit,
            min_similarity,
            query_head,
        )
    }

    fn bump_version(&self, tenant_id: &TenantId) {
        *self
            .tenant_versions
            .entry(tenant_id.as_str().to_string())
            .or_insert(0) += 1;
    }
}

/// Case-insensitive keyword fallback: title 0.5, content 0.3, keywords 0.2.
fn keyword_search(entries: Vec<KnowledgeEntry>, query: &str) -> Vec<ScoredEntry> {
    let query_lower = query.to_lowercase();
    entries
        .into_iter()
        .filter_map(|entry| {
            let mut score = 0.0f32;
            if entry.title.to_lowercase().contains(&query_lower) {
                score += 0.5;
            }
            if entry.content.to_lowercase().contains(&query_lower) {
                score += 0.3;
            }
            if !entry.keywords.is_empty() && entry.keywords.to_lowercase().contains(&query_lower) {
                score += 0.2;
            }
            (score > 0.0).then_some(ScoredEntry { entry, score })
        })
        .collect()
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    let kind: String = row.get(2)?;
    let embedding: Option<String> = row.get(7)?;
    let metadata: String = row.get(8)?;
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        kind: kind.parse().unwrap_or(EntryKind::General),
        title: row.get(3)?,
        content: row.get(4)?,
        category: row.get(5)?,
        keywords: row.get(6)?,
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        priority: row.get::<_, i64>(9)? as u8,
        active: row.get::<_, i64>(10)? != 0,
        version: row.get::<_, i64>(11)? as u32,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Maps a few fixed phrases to fixed unit vectors so similarity ordering
    /// is predictable without a live embedding service.
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, KnowledgeError> {
            let lower = text.to_lowercase();
            if lower.contains("return") || lower.contains("refund") {
                Ok(vec![1.0, 0.0, 0.0])
            } else if lower.contains("shipping") {
                Ok(vec![0.0, 1.0, 0.0])
            } else {
                Ok(vec![0.0, 0.0, 1.0])
            }
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, KnowledgeError> {
            Err(KnowledgeError::Embedding("service down".into()))
        }
    }

    fn store(embedder: Option<Arc<dyn Embedder>>) -> KnowledgeStore {
        KnowledgeStore::new(Connection::open_in_memory().unwrap(), embedder).unwrap()
    }

    async fn seed(store: &KnowledgeStore, tenant: &TenantId) {
        store
            .create_entry(
                tenant,
                EntryKind::Policy,
                "Return policy",
                "Items can be returned within 30 days for a full refund.",
                Some("policies"),
                &["returns", "refund"],
                serde_json::json!({}),
                80,
            )
            .await
            .unwrap();
        store
            .create_entry(
                tenant,
                EntryKind::Faq,
                "Shipping times",
                "Standard shipping takes 3-5 business days.",
                None,
                &["shipping", "delivery"],
                serde_json::json!({}),
                50,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn semantic_search_ranks_by_similarity() {
        let tenant = TenantId::new();
        let store = store(Some(Arc::new(StubEmbedder)));
        seed(&store, &tenant).await;

        let results = store
            .search(&tenant, "how do refunds work?", None, 5, 0.7)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.title, "Return policy");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn keyword_fallback_when_embedder_fails() {
        let tenant = TenantId::new();
        let store = store(Some(Arc::new(BrokenEmbedder)));
        seed(&store, &tenant).await;

        let results = store
            .search(&tenant, "delivery", None, 5, 0.7)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.title, "Shipping times");
        // keywords only: "delivery" appears in neither title nor content
        assert!((results[0].score - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn soft_deleted_entries_are_not_searched() {
        let tenant = TenantId::new();
        let store = store(Some(Arc::new(StubEmbedder)));
        seed(&store, &tenant).await;

        let hit = store
            .search(&tenant, "refund", None, 5, 0.7)
            .await
            .unwrap();
        store.delete_entry(&tenant, &hit[0].entry.id).unwrap();

        let results = store.search(&tenant, "refund", None, 5, 0.7).await.unwrap();
        assert!(results.is_empty());

        // Soft delete keeps the row with active = false and a bumped version.
        let raw = store.get_entry(&tenant, &hit[0].entry.id).unwrap();
        assert!(!raw.active);
        assert_eq!(raw.version, 2);
    }

    #[tokio::test]
    async fn update_content_regenerates_embedding_and_bumps_version() {
        let tenant = TenantId::new();
        let store = store(Some(Arc::new(StubEmbedder)));
        seed(&store, &tenant).await;
        let entry = store
            .search(&tenant, "shipping", None, 1, 0.7)
            .await
            .unwrap()
            .remove(0)
            .entry;

        let updated = store
            .update_entry(
                &tenant,
                &entry.id,
                None,
                Some("We now offer refunds on shipping charges."),
                None,
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        // New content maps to the "refund" stub vector.
        assert_eq!(updated.embedding, Some(vec![1.0, 0.0, 0.0]));
    }

    #[tokio::test]
    async fn search_is_tenant_scoped() {
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let store = store(Some(Arc::new(StubEmbedder)));
        seed(&store, &tenant_a).await;

        let results = store
            .search(&tenant_b, "refund", None, 5, 0.0)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn priority_breaks_similarity_ties() {
        let tenant = TenantId::new();
        let store = store(Some(Arc::new(StubEmbedder)));
        store
            .create_entry(
                &tenant,
                EntryKind::Faq,
                "Refund window",
                "30 day refund window.",
                None,
                &[],
                serde_json::json!({}),
                10,
            )
            .await
            .unwrap();
        store
            .create_entry(
                &tenant,
                EntryKind::Policy,
                "Refund method",
                "Refunds go to the original payment method.",
                None,
                &[],
                serde_json::json!({}),
                90,
            )
            .await
            .unwrap();

        let results = store.search(&tenant, "refund", None, 5, 0.7).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entry.title, "Refund method");
    }
}
