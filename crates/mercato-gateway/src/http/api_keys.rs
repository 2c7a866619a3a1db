use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::auth::{authenticate, require_scope, ApiError};

/// List stored keys: prefix and metadata only, never hashes or full keys.
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "users:manage")?;

    let keys = state.tenants.list_api_keys(&ctx.tenant_id)?;
    Ok(Json(serde_json::json!({ "api_keys": keys })))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub label: String,
}

/// Generate a key. The full key appears in this response only; subsequent
/// reads expose the 8-char prefix.
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "users:manage")?;

    if body.label.trim().is_empty() {
        return Err(ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "INPUT_INVALID",
            "label must not be empty",
        ));
    }

    let (record, full_key) =
        state
            .tenants
            .generate_api_key(&ctx.tenant_id, &body.label, ctx.actor.user_id())?;
    Ok(Json(serde_json::json!({
        "api_key": record,
        "key": full_key,
        "warning": "Store this key now; it will not be shown again.",
    })))
}

pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "users:manage")?;

    state.tenants.revoke_api_key(&ctx.tenant_id, &id)?;
    Ok(Json(serde_json::json!({ "revoked": id })))
}
