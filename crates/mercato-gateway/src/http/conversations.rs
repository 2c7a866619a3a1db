use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use mercato_conversations::types::ConversationState;
use mercato_core::types::ConversationId;

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

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;

    let conversations = state
        .conversations
        .list_for_tenant(&ctx.tenant_id, query.limit.min(200))
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;

    let conversation = state
        .conversations
        .get(&ctx.tenant_id, &ConversationId::from(id))
        .map_err(not_found)?;
    Ok(Json(serde_json::json!({ "conversation": conversation })))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "conversations:view")?;

    let conversation_id = ConversationId::from(id);
    // Tenant scoping: the conversation must belong to the caller's tenant.
    state
        .conversations
        .get(&ctx.tenant_id, &conversation_id)
        .map_err(not_found)?;
    let messages = state
        .conversations
        .last_messages(&conversation_id, query.limit.min(500))
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

#[derive(Deserialize, Default)]
pub struct HandoffBody {
    pub reason: Option<String>,
    pub agent: Option<String>,
}

pub async fn handoff_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<HandoffBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = authenticate(&state, &headers, None)?;
    require_scope(&ctx, "handoff:perform")?;

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let conversation = state
        .conversations
        .transition_state(
            &ctx.tenant_id,
            &ConversationId::from(id),
            ConversationState::HandedOff,
            body.reason.as_deref().or(Some("manual_handoff")),
            body.agent.as_deref().or(ctx.actor.user_id()),
        )
        .map_err(|e| match e {
            mercato_conversations::ConversationError::NotFound(id) => ApiError::new(
                axum::http::StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Conversation not found: {id}"),
            ),
            mercato_conversations::ConversationError::InvalidTransition { from, to } => {
                ApiError::new(
                    axum::http::StatusCode::CONFLICT,
                    "CONFLICT",
                    format!("Invalid state transition: {from} -> {to}"),
                )
            }
            other => internal(other),
        })?;
    Ok(Json(serde_json::json!({ "conversation": conversation })))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        e.to_string(),
    )
}

fn not_found(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(axum::http::StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
}
