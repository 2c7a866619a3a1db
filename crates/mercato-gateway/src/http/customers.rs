use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use mercato_core::types::CustomerId;

use crate::app::AppState;
use crate::auth::{authenticate, require_scope, ApiError};

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_customers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;

    let customers = state
        .tenants
        .list_customers(&ctx.tenant_id, query.limit.min(200))?;
    Ok(Json(serde_json::json!({ "customers": customers })))
}

pub async fn get_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;

    let customer = state
        .tenants
        .get_customer(&ctx.tenant_id, &CustomerId::from(id))?;
    Ok(Json(serde_json::json!({ "customer": customer })))
}

#[derive(Deserialize, Default)]
pub struct ExportBody {
    #[serde(default)]
    pub mask_pii: bool,
    #[serde(default)]
    pub include_conversations: bool,
    #[serde(default)]
    pub include_consent_history: bool,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "json".to_string()
}

/// Export one customer's data for compliance requests. JSON by default, CSV
/// on request; PII masking blanks the phone's middle digits.
pub async fn export_customer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ExportBody>>,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    if body.format != "json" && body.format != "csv" {
        return Err(ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "INPUT_INVALID",
            "format must be one of: json, csv",
        ));
    }

    let customer_id = CustomerId::from(id);
    let mut customer = state.tenants.get_customer(&ctx.tenant_id, &customer_id)?;
    if body.mask_pii {
        customer.phone = mask_phone(&customer.phone);
        customer.display_name = customer.display_name.map(|_| "[masked]".to_string());
    }

    let mut export = serde_json::json!({ "customer": customer });

    if body.include_consent_history {
        let history = state
            .tenants
            .consent_history(&ctx.tenant_id, &customer_id)?;
        export["consent_history"] = serde_json::to_value(history).unwrap_or_default();
    }

    if body.include_conversations {
        let conversations = state
            .conversations
            .list_for_tenant(&ctx.tenant_id, 1000)
            .map_err(|e| {
                ApiError::new(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    e.to_string(),
                )
            })?;
        let own: Vec<_> = conversations
            .into_iter()
            .filter(|c| c.customer_id == customer_id)
            .collect();
        export["conversations"] = serde_json::to_value(own).unwrap_or_default();
    }

    if body.format == "csv" {
        let csv = export_csv(&export);
        return Ok((
            [(axum::http::header::CONTENT_TYPE, "text/csv")],
            csv,
        )
            .into_response());
    }
    Ok(Json(export).into_response())
}

fn mask_phone(phone: &str) -> String {
    if phone.len() <= 6 {
        return "*".repeat(phone.len());
    }
    let head = &phone[..4];
    let tail = &phone[phone.len() - 2..];
    format!("{head}{}{tail}", "*".repeat(phone.len() - 6))
}

/// Flat CSV rendering of the export: one `section,key,value` row per leaf.
fn export_csv(export: &serde_json::Value) -> String {
    let mut out = String::from("section,key,value\n");
    if let Some(map) = export.as_object() {
        for (section, value) in map {
            flatten_into(&mut out, section, "", value);
        }
    }
    out
}

fn flatten_into(out: &mut String, section: &str, prefix: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, section, &path, inner);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, inner) in items.iter().enumerate() {
                let path = if prefix.is_empty() {
                    index.to_string()
                } else {
                    format!("{prefix}.{index}")
                };
                flatten_into(out, section, &path, inner);
            }
        }
        leaf => {
            let rendered = match leaf {
                serde_json::Value::String(s) => s.replace('"', "\"\""),
                other => other.to_string(),
            };
            out.push_str(&format!("{section},{prefix},\"{rendered}\"\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_masking_keeps_ends() {
        assert_eq!(mask_phone("+254711222333"), "+254*******33");
        assert_eq!(mask_phone("+1234"), "*****");
    }

    #[test]
    fn csv_flattens_nested_values() {
        let csv = export_csv(&serde_json::json!({
            "customer": { "phone": "+254711222333", "tags": ["vip"] }
        }));
        assert!(csv.starts_with("section,key,value\n"));
        assert!(csv.contains("customer,phone,\"+254711222333\""));
        assert!(csv.contains("customer,tags.0,\"vip\""));
    }
}
