use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a tenant (UUIDv7 — time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Unique identifier for a customer within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

/// Unique identifier for a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                // UUIDv7 includes timestamp — sortable and traceable in logs
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_impls!(TenantId);
id_impls!(CustomerId);
id_impls!(ConversationId);
id_impls!(MessageId);

/// Who initiated a request. Channel webhooks and background workers act as
/// `System`; admin API calls carry the authenticated user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    User(String),
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::User(id) => Some(id),
            Actor::System => None,
        }
    }
}

/// The effective set of permission codes an actor holds within a tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSet(pub HashSet<String>);

impl ScopeSet {
    pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(scopes.into_iter().map(Into::into).collect())
    }

    /// System actors (webhooks, schedulers) carry every scope.
    pub fn all() -> Self {
        Self::new(["*"])
    }

    pub fn has(&self, scope: &str) -> bool {
        self.0.contains("*") || self.0.contains(scope)
    }
}

/// Immutable per-request context, resolved once at every entry point and
/// passed explicitly through all core calls.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub actor: Actor,
    pub scopes: ScopeSet,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, actor: Actor, scopes: ScopeSet) -> Self {
        Self {
            tenant_id,
            actor,
            scopes,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Context for internal workers (scheduler, harmonizer flush).
    pub fn system(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, Actor::System, ScopeSet::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_set_wildcard_grants_everything() {
        let ctx = RequestContext::system(TenantId::new());
        assert!(ctx.scopes.has("conversations:view"));
        assert!(ctx.scopes.has("users:manage"));
    }

    #[test]
    fn scope_set_exact_match_only() {
        let scopes = ScopeSet::new(["conversations:view"]);
        assert!(scopes.has("conversations:view"));
        assert!(!scopes.has("handoff:perform"));
    }

    #[test]
    fn ids_are_sortable_by_creation() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert!(a.as_str() <= b.as_str());
    }
}
