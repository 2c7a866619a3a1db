//! Admin-API authentication: bearer API key + explicit tenant header,
//! resolved into a `RequestContext`. Errors use the canonical envelope
//! `{error, code, details?}`; rate limiting is per user (or per IP for
//! unauthenticated requests).

use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use mercato_core::types::{RequestContext, TenantId};
use mercato_core::MercatoError;
use mercato_tenants::TenantError;

use crate::app::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Wire-level error carrying the canonical envelope.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_core(error: MercatoError) -> Self {
        let retry_after = match &error {
            MercatoError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        Self {
            status: StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: error.code(),
            message: error.to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.message,
            "code": self.code,
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<TenantError> for ApiError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::UnknownTenant(id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "UNKNOWN_TENANT",
                format!("Unknown tenant: {id}"),
            ),
            TenantError::NotAMember => ApiError::new(
                StatusCode::FORBIDDEN,
                "NOT_AUTHORIZED",
                "Actor is not a member of this tenant",
            ),
            TenantError::InvalidApiKey => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "NOT_AUTHENTICATED",
                "Invalid API key",
            ),
            TenantError::CustomerNotFound(id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Customer not found: {id}"),
            ),
            TenantError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INPUT_INVALID", message)
            }
            TenantError::TransactionalConsentImmutable => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INPUT_INVALID",
                "Transactional consent cannot be revoked",
            ),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                other.to_string(),
            ),
        }
    }
}

/// Authenticate a tenant-scoped admin request and enforce the rate limit.
pub fn authenticate(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<std::net::SocketAddr>>,
) -> Result<RequestContext, ApiError> {
    let tenant_id = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(TenantId::from)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "INPUT_INVALID",
                "Missing X-TENANT-ID header",
            )
        })?;

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "NOT_AUTHENTICATED",
                "Missing bearer token",
            )
        })?;

    let context = state.tenants.resolve_api(&tenant_id, bearer)?;

    // Rate limit keyed by user id, falling back to client IP.
    let key = context
        .actor
        .user_id()
        .map(String::from)
        .or_else(|| connect_info.map(|ci| ci.0.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string());
    check_rate_limit(state, &key)?;

    Ok(context)
}

/// Fixed one-minute window counter per key.
pub fn check_rate_limit(state: &Arc<AppState>, key: &str) -> Result<(), ApiError> {
    let limit = state.config.gateway.rate_limit_per_minute;
    let window = Utc::now().timestamp() / 60;
    let mut bucket = state
        .rate_buckets
        .entry(key.to_string())
        .or_insert((window, 0));
    if bucket.0 != window {
        *bucket = (window, 0);
    }
    bucket.1 += 1;
    if bucket.1 > limit {
        let retry_after = 60 - (Utc::now().timestamp() % 60) as u64;
        return Err(ApiError::from_core(MercatoError::RateLimited {
            retry_after_secs: retry_after,
        }));
    }
    Ok(())
}

/// Scope check helper shared by all handlers.
pub fn require_scope(context: &RequestContext, scope: &str) -> Result<(), ApiError> {
    if context.scopes.has(scope) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "NOT_AUTHORIZED",
            format!("Missing scope: {scope}"),
        ))
    }
}
