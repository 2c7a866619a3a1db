use serde::{Deserialize, Serialize};

use mercato_core::types::TenantId;

/// Kind of knowledge entry; used for filtered retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Faq,
    Policy,
    ProductInfo,
    ServiceInfo,
    Procedure,
    General,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Faq => "faq",
            EntryKind::Policy => "policy",
            EntryKind::ProductInfo => "product_info",
            EntryKind::ServiceInfo => "service_info",
            EntryKind::Procedure => "procedure",
            EntryKind::General => "general",
        }
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "faq" => Ok(EntryKind::Faq),
            "policy" => Ok(EntryKind::Policy),
            "product_info" => Ok(EntryKind::ProductInfo),
            "service_info" => Ok(EntryKind::ServiceInfo),
            "procedure" => Ok(EntryKind::Procedure),
            "general" => Ok(EntryKind::General),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

/// A tenant-scoped knowledge base entry with its dense embedding.
/// Deletion is soft (`active = false`); version increases monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub tenant_id: TenantId,
    pub kind: EntryKind,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    /// Comma-separated keyword list used by the fallback search.
    pub keywords: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub priority: u8,
    pub active: bool,
    pub version: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Search hit: entry plus a similarity score in [0, 1].
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f32,
}
