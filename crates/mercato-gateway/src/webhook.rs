//! Inbound channel webhook: HMAC-SHA256 verification over the raw body,
//! tenant resolution by destination number, inbound message persistence and
//! burst buffering. A bad signature is a 401 and the event is dropped.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use mercato_conversations::types::{Direction, MessageType};

use crate::app::AppState;
use crate::auth::ApiError;

pub const SIGNATURE_HEADER: &str = "x-signature-256";

/// Verified inbound event delivered by the channel gateway.
#[derive(Deserialize)]
pub struct InboundEvent {
    /// The tenant's channel number the customer wrote to.
    pub to: String,
    /// The customer's phone number.
    pub from: String,
    pub text: String,
    /// Channel-assigned message id, used for idempotent appends.
    pub provider_message_id: Option<String>,
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_signature(&state, &headers, &body)?;

    let event: InboundEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "INPUT_INVALID",
            format!("malformed webhook payload: {e}"),
        )
    })?;

    let (tenant, _ctx) = state.tenants.resolve_webhook(&event.to)?;
    let customer = state
        .tenants
        .get_or_create_customer(&tenant.id, &event.from)?;
    let conversation = state
        .conversations
        .get_or_create_active(&tenant.id, &customer.id, "whatsapp")
        .map_err(internal)?;

    let message = match state.conversations.append_message(
        &conversation.id,
        Direction::In,
        MessageType::CustomerInbound,
        &event.text,
        serde_json::json!({}),
        event.provider_message_id.as_deref(),
    ) {
        Ok(message) => message,
        Err(mercato_conversations::ConversationError::DuplicateProviderMessageId(id)) => {
            // Redelivered webhook: acknowledge without re-buffering.
            info!(provider_message_id = %id, "duplicate inbound delivery ignored");
            return Ok(Json(serde_json::json!({ "status": "duplicate" })));
        }
        Err(mercato_conversations::ConversationError::TextTooLong { len, max }) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INPUT_INVALID",
                format!("message text of {len} chars exceeds limit of {max}"),
            ));
        }
        Err(e) => return Err(internal(e)),
    };

    state
        .harmonizer
        .enqueue(&tenant.id, &conversation.id, message.id.as_str(), &event.text)
        .map_err(internal)?;

    Ok(Json(serde_json::json!({
        "status": "queued",
        "conversation_id": conversation.id,
    })))
}

fn verify_signature(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let Some(secret) = &state.config.gateway.webhook_secret else {
        // No secret configured: only sensible for local development.
        warn!("webhook secret not configured; accepting unsigned event");
        return Ok(());
    };

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("sha256="))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "SIGNATURE_INVALID",
                "missing webhook signature",
            )
        })?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| internal("invalid webhook secret"))?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    // Constant-time comparison over the hex strings.
    let matches = provided.len() == expected.len()
        && provided
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if !matches {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "SIGNATURE_INVALID",
            "webhook signature mismatch",
        ));
    }
    Ok(())
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        e.to_string(),
    )
}
