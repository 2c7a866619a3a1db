use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use mercato_core::types::{Actor, CustomerId, RequestContext, ScopeSet, TenantId};

use crate::db::init_db;
use crate::error::{Result, TenantError};
use crate::settings::{AgentSettings, VersionedSettings};
use crate::types::*;

/// Thread-safe store for tenants, customers, preferences and API keys.
///
/// Wraps a single SQLite connection in a `Mutex`. The webhook hot path caches
/// the channel-number → tenant-id mapping in memory to avoid a DB round-trip
/// on every inbound message.
pub struct TenantStore {
    db: Arc<Mutex<Connection>>,
    channel_cache: DashMap<String, String>,
}

impl TenantStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            channel_cache: DashMap::new(),
        })
    }

    // ── tenants ──────────────────────────────────────────────────────────────

    pub fn create_tenant(
        &self,
        name: &str,
        channel_number: &str,
        allowed_languages: Vec<String>,
        quiet_hours: Option<QuietHours>,
        limits: TenantLimits,
    ) -> Result<Tenant> {
        let id = TenantId::new();
        let now = chrono::Utc::now().to_rfc3339();
        let langs = if allowed_languages.is_empty() {
            vec!["en".to_string()]
        } else {
            allowed_languages
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tenants
             (id, name, channel_number, channel_credentials, allowed_languages,
              quiet_hours, limits, created_at)
             VALUES (?1, ?2, ?3, '{}', ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id.as_str(),
                name,
                channel_number,
                serde_json::to_string(&langs)?,
                quiet_hours
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&limits)?,
                now,
            ],
        )?;
        info!(tenant_id = %id, %name, "tenant created");

        Ok(Tenant {
            id,
            name: name.to_string(),
            channel_number: channel_number.to_string(),
            channel_credentials: serde_json::json!({}),
            allowed_languages: langs,
            quiet_hours,
            limits,
            created_at: now,
        })
    }

    pub fn get_tenant(&self, id: &TenantId) -> Result<Tenant> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, channel_number, channel_credentials, allowed_languages,
                    quiet_hours, limits, created_at
             FROM tenants WHERE id = ?1",
            [id.as_str()],
            row_to_tenant,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => TenantError::UnknownTenant(id.to_string()),
            other => TenantError::Database(other),
        })
    }

    /// Resolve the tenant that owns a destination channel number.
    /// Used by the inbound webhook path.
    pub fn find_by_channel_number(&self, channel_number: &str) -> Result<Tenant> {
        if let Some(cached) = self.channel_cache.get(channel_number) {
            debug!(channel_number, "channel cache hit");
            let id = TenantId::from(cached.value().clone());
            drop(cached);
            return self.get_tenant(&id);
        }

        let tenant = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT id, name, channel_number, channel_credentials, allowed_languages,
                        quiet_hours, limits, created_at
                 FROM tenants WHERE channel_number = ?1",
                [channel_number],
                row_to_tenant,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    TenantError::UnknownTenant(channel_number.to_string())
                }
                other => TenantError::Database(other),
            })?
        };
        self.channel_cache
            .insert(channel_number.to_string(), tenant.id.to_string());
        Ok(tenant)
    }

    pub fn set_channel_credentials(
        &self,
        tenant_id: &TenantId,
        credentials: serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE tenants SET channel_credentials = ?2 WHERE id = ?1",
            rusqlite::params![tenant_id.as_str(), serde_json::to_string(&credentials)?],
        )?;
        if n == 0 {
            return Err(TenantError::UnknownTenant(tenant_id.to_string()));
        }
        Ok(())
    }

    // ── request-context resolution ───────────────────────────────────────────

    /// Resolve an admin API call: explicit tenant header + bearer API key.
    ///
    /// The key is matched by SHA-256 hash; a hit stamps `last_used_at`. The
    /// scope set comes from the creating user's membership; keys without a
    /// creator act as the system.
    pub fn resolve_api(&self, tenant_id: &TenantId, bearer_key: &str) -> Result<RequestContext> {
        // Tenant existence first so an unknown tenant is a 404, not a 401.
        self.get_tenant(tenant_id)?;

        let hash = sha256_hex(bearer_key);
        let now = chrono::Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        let created_by: Option<String> = db
            .query_row(
                "SELECT created_by FROM api_keys
                 WHERE tenant_id = ?1 AND key_hash = ?2 AND revoked = 0",
                rusqlite::params![tenant_id.as_str(), hash],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => TenantError::InvalidApiKey,
                other => TenantError::Database(other),
            })?;

        db.execute(
            "UPDATE api_keys SET last_used_at = ?3
             WHERE tenant_id = ?1 AND key_hash = ?2",
            rusqlite::params![tenant_id.as_str(), hash, now],
        )?;

        let (actor, scopes) = match created_by {
            Some(user_id) => {
                let scopes_csv: String = db
                    .query_row(
                        "SELECT scopes FROM memberships WHERE tenant_id = ?1 AND user_id = ?2",
                        rusqlite::params![tenant_id.as_str(), user_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => TenantError::NotAMember,
                        other => TenantError::Database(other),
                    })?;
                let scopes = ScopeSet::new(scopes_csv.split(',').map(str::trim));
                (Actor::User(user_id), scopes)
            }
            None => (Actor::System, ScopeSet::all()),
        };

        Ok(RequestContext::new(tenant_id.clone(), actor, scopes))
    }

    /// Resolve an inbound channel event by destination number: system actor,
    /// full scopes. Signature verification happens before this is called.
    pub fn resolve_webhook(&self, channel_number: &str) -> Result<(Tenant, RequestContext)> {
        let tenant = self.find_by_channel_number(channel_number)?;
        let ctx = RequestContext::system(tenant.id.clone());
        Ok((tenant, ctx))
    }

    pub fn add_member(&self, tenant_id: &TenantId, user_id: &str, scopes: &[&str]) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO memberships (tenant_id, user_id, scopes) VALUES (?1, ?2, ?3)",
            rusqlite::params![tenant_id.as_str(), user_id, scopes.join(",")],
        )?;
        Ok(())
    }

    // ── API keys ─────────────────────────────────────────────────────────────

    /// Generate a new API key. Returns the record and the full key — the only
    /// time it is ever visible. Only the hash and an 8-char prefix persist.
    pub fn generate_api_key(
        &self,
        tenant_id: &TenantId,
        label: &str,
        created_by: Option<&str>,
    ) -> Result<(ApiKey, String)> {
        self.get_tenant(tenant_id)?;

        let raw: [u8; 24] = rand::random();
        let full_key = format!("mk_{}", hex::encode(raw));
        let prefix: String = full_key.chars().take(8).collect();
        let key = ApiKey {
            id: Uuid::now_v7().to_string(),
            key_hash: sha256_hex(&full_key),
            prefix,
            label: label.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            created_by: created_by.map(String::from),
            last_used_at: None,
            revoked: false,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO api_keys
             (id, tenant_id, key_hash, prefix, label, created_at, created_by, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            rusqlite::params![
                key.id,
                tenant_id.as_str(),
                key.key_hash,
                key.prefix,
                key.label,
                key.created_at,
                key.created_by,
            ],
        )?;
        info!(tenant_id = %tenant_id, key_id = %key.id, "API key generated");

        Ok((key, full_key))
    }

    pub fn list_api_keys(&self, tenant_id: &TenantId) -> Result<Vec<ApiKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, key_hash, prefix, label, created_at, created_by, last_used_at, revoked
             FROM api_keys WHERE tenant_id = ?1 AND revoked = 0
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([tenant_id.as_str()], |row| {
            Ok(ApiKey {
                id: row.get(0)?,
                key_hash: row.get(1)?,
                prefix: row.get(2)?,
                label: row.get(3)?,
                created_at: row.get(4)?,
                created_by: row.get(5)?,
                last_used_at: row.get(6)?,
                revoked: row.get::<_, i64>(7)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn revoke_api_key(&self, tenant_id: &TenantId, key_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE api_keys SET revoked = 1 WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id.as_str(), key_id],
        )?;
        if n == 0 {
            return Err(TenantError::InvalidApiKey);
        }
        info!(tenant_id = %tenant_id, key_id, "API key revoked");
        Ok(())
    }

    // ── customers ────────────────────────────────────────────────────────────

    /// Look up a customer by normalised phone, creating on first contact.
    /// Existing customers get their `last_seen_at` bumped.
    pub fn get_or_create_customer(&self, tenant_id: &TenantId, phone: &str) -> Result<Customer> {
        let phone = normalize_phone(phone);
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        let existing = db
            .query_row(
                "SELECT id, tenant_id, phone, display_name, locale, tags,
                        first_seen_at, last_seen_at
                 FROM customers WHERE tenant_id = ?1 AND phone = ?2",
                rusqlite::params![tenant_id.as_str(), phone],
                row_to_customer,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(TenantError::Database(other)),
            })?;

        if let Some(mut customer) = existing {
            db.execute(
                "UPDATE customers SET last_seen_at = ?2 WHERE id = ?1",
                rusqlite::params![customer.id.as_str(), now],
            )?;
            customer.last_seen_at = now;
            return Ok(customer);
        }

        let id = CustomerId::new();
        db.execute(
            "INSERT INTO customers
             (id, tenant_id, phone, tags, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, '[]', ?4, ?4)",
            rusqlite::params![id.as_str(), tenant_id.as_str(), phone, now],
        )?;
        info!(tenant_id = %tenant_id, customer_id = %id, "customer created on first contact");

        Ok(Customer {
            id,
            tenant_id: tenant_id.clone(),
            phone,
            display_name: None,
            locale: None,
            tags: Vec::new(),
            first_seen_at: now.clone(),
            last_seen_at: now,
        })
    }

    pub fn get_customer(&self, tenant_id: &TenantId, id: &CustomerId) -> Result<Customer> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, phone, display_name, locale, tags,
                    first_seen_at, last_seen_at
             FROM customers WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id.as_str(), id.as_str()],
            row_to_customer,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => TenantError::CustomerNotFound(id.to_string()),
            other => TenantError::Database(other),
        })
    }

    pub fn list_customers(&self, tenant_id: &TenantId, limit: usize) -> Result<Vec<Customer>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, phone, display_name, locale, tags,
                    first_seen_at, last_seen_at
             FROM customers WHERE tenant_id = ?1
             ORDER BY last_seen_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![tenant_id.as_str(), limit as i64],
            row_to_customer,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── consent ──────────────────────────────────────────────────────────────

    pub fn get_or_create_preferences(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
    ) -> Result<CustomerPreferences> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO customer_preferences
             (customer_id, tenant_id, transactional_messages, reminder_messages,
              promotional_messages, updated_at)
             VALUES (?1, ?2, 1, 1, 0, ?3)",
            rusqlite::params![customer_id.as_str(), tenant_id.as_str(), now],
        )?;
        db.query_row(
            "SELECT customer_id, transactional_messages, reminder_messages,
                    promotional_messages, updated_at
             FROM customer_preferences WHERE customer_id = ?1 AND tenant_id = ?2",
            rusqlite::params![customer_id.as_str(), tenant_id.as_str()],
            row_to_preferences,
        )
        .map_err(TenantError::Database)
    }

    /// Flip one consent flag, emitting exactly one append-only `ConsentEvent`
    /// in the same transaction. A no-op change emits nothing. Revoking
    /// transactional consent is rejected.
    pub fn set_consent(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        kind: ConsentKind,
        new_value: bool,
        source: ConsentSource,
        reason: Option<&str>,
        changed_by: Option<&str>,
    ) -> Result<CustomerPreferences> {
        if kind == ConsentKind::TransactionalMessages && !new_value {
            return Err(TenantError::TransactionalConsentImmutable);
        }

        let current = self.get_or_create_preferences(tenant_id, customer_id)?;
        let previous = match kind {
            ConsentKind::TransactionalMessages => current.transactional_messages,
            ConsentKind::ReminderMessages => current.reminder_messages,
            ConsentKind::PromotionalMessages => current.promotional_messages,
        };
        if previous == new_value {
            return Ok(current);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            &format!(
                "UPDATE customer_preferences SET {} = ?3, updated_at = ?4
                 WHERE customer_id = ?1 AND tenant_id = ?2",
                kind.as_str()
            ),
            rusqlite::params![
                customer_id.as_str(),
                tenant_id.as_str(),
                new_value as i64,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO consent_events
             (id, tenant_id, customer_id, kind, previous_value, new_value,
              source, reason, changed_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                Uuid::now_v7().to_string(),
                tenant_id.as_str(),
                customer_id.as_str(),
                kind.as_str(),
                previous as i64,
                new_value as i64,
                source.as_str(),
                reason,
                changed_by,
                now,
            ],
        )?;
        tx.commit()?;
        drop(db);
        info!(
            tenant_id = %tenant_id,
            customer_id = %customer_id,
            kind = kind.as_str(),
            previous,
            new_value,
            "consent changed"
        );

        self.get_or_create_preferences(tenant_id, customer_id)
    }

    pub fn consent_history(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConsentEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, customer_id, kind, previous_value, new_value,
                    source, reason, changed_by, created_at
             FROM consent_events
             WHERE tenant_id = ?1 AND customer_id = ?2
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![tenant_id.as_str(), customer_id.as_str()],
            |row| {
                let kind: String = row.get(3)?;
                let source: String = row.get(6)?;
                Ok(ConsentEvent {
                    id: row.get(0)?,
                    tenant_id: TenantId::from(row.get::<_, String>(1)?),
                    customer_id: CustomerId::from(row.get::<_, String>(2)?),
                    kind: kind.parse().unwrap_or(ConsentKind::PromotionalMessages),
                    previous_value: row.get::<_, i64>(4)? != 0,
                    new_value: row.get::<_, i64>(5)? != 0,
                    source: source.parse().unwrap_or(ConsentSource::System),
                    reason: row.get(7)?,
                    changed_by: row.get(8)?,
                    created_at: row.get(9)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── agent settings ───────────────────────────────────────────────────────

    /// Fetch the tenant's agent configuration, creating a defaulted row on
    /// first access.
    pub fn get_settings(&self, tenant_id: &TenantId) -> Result<VersionedSettings> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO agent_settings (tenant_id, settings, version, updated_at)
             VALUES (?1, ?2, 1, ?3)",
            rusqlite::params![
                tenant_id.as_str(),
                serde_json::to_string(&AgentSettings::default())?,
                now
            ],
        )?;
        let (json, version, updated_at): (String, u32, String) = db.query_row(
            "SELECT settings, version, updated_at FROM agent_settings WHERE tenant_id = ?1",
            [tenant_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(VersionedSettings {
            settings: serde_json::from_str(&json)?,
            version,
            updated_at,
        })
    }

    /// Validate and persist new settings, bumping the version.
    pub fn update_settings(
        &self,
        tenant_id: &TenantId,
        settings: &AgentSettings,
    ) -> Result<VersionedSettings> {
        settings.validate()?;
        // Ensure the row exists so the bump below always matches.
        self.get_settings(tenant_id)?;

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE agent_settings
             SET settings = ?2, version = version + 1, updated_at = ?3
             WHERE tenant_id = ?1",
            rusqlite::params![tenant_id.as_str(), serde_json::to_string(settings)?, now],
        )?;
        let version: u32 = db.query_row(
            "SELECT version FROM agent_settings WHERE tenant_id = ?1",
            [tenant_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(VersionedSettings {
            settings: settings.clone(),
            version,
            updated_at: now,
        })
    }
}

/// Strip formatting characters and normalise an international phone number to
/// a bare `+`-prefixed digit string.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let creds: String = row.get(3)?;
    let langs: String = row.get(4)?;
    let quiet: Option<String> = row.get(5)?;
    let limits: String = row.get(6)?;
    Ok(Tenant {
        id: TenantId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        channel_number: row.get(2)?,
        channel_credentials: serde_json::from_str(&creds).unwrap_or(serde_json::json!({})),
        allowed_languages: serde_json::from_str(&langs).unwrap_or_else(|_| vec!["en".to_string()]),
        quiet_hours: quiet.and_then(|q| serde_json::from_str(&q).ok()),
        limits: serde_json::from_str(&limits).unwrap_or_default(),
        created_at: row.get(7)?,
    })
}

fn row_to_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    let tags: String = row.get(5)?;
    Ok(Customer {
        id: CustomerId::from(row.get::<_, String>(0)?),
        tenant_id: TenantId::from(row.get::<_, String>(1)?),
        phone: row.get(2)?,
        display_name: row.get(3)?,
        locale: row.get(4)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        first_seen_at: row.get(6)?,
        last_seen_at: row.get(7)?,
    })
}

fn row_to_preferences(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerPreferences> {
    Ok(CustomerPreferences {
        customer_id: CustomerId::from(row.get::<_, String>(0)?),
        transactional_messages: row.get::<_, i64>(1)? != 0,
        reminder_messages: row.get::<_, i64>(2)? != 0,
        promotional_messages: row.get::<_, i64>(3)? != 0,
        updated_at: row.get(4)?,
    })
}
