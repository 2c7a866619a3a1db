use serde::{Deserialize, Serialize};

use mercato_core::types::{CustomerId, TenantId};

/// Root of isolation. Every persisted entity hangs off one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// Channel identity — the messaging number customers write to.
    pub channel_number: String,
    /// Channel credentials stored as an opaque JSON blob.
    pub channel_credentials: serde_json::Value,
    /// Ordered list of languages the agent may reply in; first is the default.
    pub allowed_languages: Vec<String>,
    pub quiet_hours: Option<QuietHours>,
    pub limits: TenantLimits,
    pub created_at: String,
}

/// Daily window (UTC, "HH:MM") during which no non-transactional outbound
/// message may be sent. May wrap midnight (e.g. 21:00 → 07:00).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: String,
    pub end: String,
}

impl QuietHours {
    /// Whether the given "HH:MM" time falls inside the window.
    pub fn contains(&self, hhmm: &str) -> bool {
        if self.start <= self.end {
            hhmm >= self.start.as_str() && hhmm < self.end.as_str()
        } else {
            // Window wraps midnight.
            hhmm >= self.start.as_str() || hhmm < self.end.as_str()
        }
    }
}

/// Subscription limits enforced by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantLimits {
    pub monthly_message_budget: u32,
    pub max_catalog_size: u32,
    pub campaign_quota: u32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            monthly_message_budget: 5_000,
            max_catalog_size: 500,
            campaign_quota: 10,
        }
    }
}

/// A stored API key record. The full key exists only at generation time;
/// only the SHA-256 hash and an 8-char display prefix are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub prefix: String,
    pub label: String,
    pub created_at: String,
    pub created_by: Option<String>,
    pub last_used_at: Option<String>,
    pub revoked: bool,
}

/// Customer identified by normalised phone number within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub phone: String,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub tags: Vec<String>,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

/// The three independent consent flags.
///
/// Transactional defaults on and cannot be revoked; reminder defaults on and
/// may be revoked; promotional defaults off and requires explicit opt-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPreferences {
    pub customer_id: CustomerId,
    pub transactional_messages: bool,
    pub reminder_messages: bool,
    pub promotional_messages: bool,
    pub updated_at: String,
}

impl CustomerPreferences {
    pub fn defaults(customer_id: CustomerId, now: String) -> Self {
        Self {
            customer_id,
            transactional_messages: true,
            reminder_messages: true,
            promotional_messages: false,
            updated_at: now,
        }
    }

    /// Whether the customer has consented to a given outbound message type.
    pub fn has_consent_for(&self, message_type: &str) -> bool {
        match message_type {
            "automated_transactional" | "transactional" => self.transactional_messages,
            "automated_reminder" | "reminder" => self.reminder_messages,
            "scheduled_promotional" | "automated_reengagement" | "promotional" => {
                self.promotional_messages
            }
            _ => false,
        }
    }
}

/// Which consent flag a `ConsentEvent` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentKind {
    TransactionalMessages,
    ReminderMessages,
    PromotionalMessages,
}

impl ConsentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentKind::TransactionalMessages => "transactional_messages",
            ConsentKind::ReminderMessages => "reminder_messages",
            ConsentKind::PromotionalMessages => "promotional_messages",
        }
    }
}

impl std::str::FromStr for ConsentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transactional_messages" => Ok(ConsentKind::TransactionalMessages),
            "reminder_messages" => Ok(ConsentKind::ReminderMessages),
            "promotional_messages" => Ok(ConsentKind::PromotionalMessages),
            other => Err(format!("unknown consent kind: {other}")),
        }
    }
}

/// Who triggered a consent change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentSource {
    Customer,
    Tenant,
    System,
}

impl ConsentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentSource::Customer => "customer",
            ConsentSource::Tenant => "tenant",
            ConsentSource::System => "system",
        }
    }
}

impl std::str::FromStr for ConsentSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "customer" => Ok(ConsentSource::Customer),
            "tenant" => Ok(ConsentSource::Tenant),
            "system" => Ok(ConsentSource::System),
            other => Err(format!("unknown consent source: {other}")),
        }
    }
}

/// Append-only audit record for every consent preference change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub id: String,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub kind: ConsentKind,
    pub previous_value: bool,
    pub new_value: bool,
    pub source: ConsentSource,
    pub reason: Option<String>,
    pub changed_by: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_hours_simple_window() {
        let qh = QuietHours {
            start: "09:00".into(),
            end: "17:00".into(),
        };
        assert!(qh.contains("12:30"));
        assert!(!qh.contains("08:59"));
        assert!(!qh.contains("17:00"));
    }

    #[test]
    fn quiet_hours_wraps_midnight() {
        let qh = QuietHours {
            start: "21:00".into(),
            end: "07:00".into(),
        };
        assert!(qh.contains("23:15"));
        assert!(qh.contains("03:00"));
        assert!(!qh.contains("12:00"));
    }

    #[test]
    fn consent_defaults() {
        let prefs =
            CustomerPreferences::defaults(CustomerId::new(), "2026-01-01T00:00:00Z".into());
        assert!(prefs.has_consent_for("automated_transactional"));
        assert!(prefs.has_consent_for("automated_reminder"));
        assert!(!prefs.has_consent_for("scheduled_promotional"));
        assert!(!prefs.has_consent_for("unknown_type"));
    }
}
