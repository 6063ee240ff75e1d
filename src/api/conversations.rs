//! Support conversation endpoints. All mutation semantics live in the
//! orchestrator (`crate::support`); these handlers only translate HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::db::{ConversationResponse, CreateConversationRequest, Message, SendMessageRequest, User};
use crate::support;
use crate::AppState;

use super::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub conversation: ConversationResponse,
    pub message: Message,
}

/// List conversations: own for users, all for admins
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Vec<ConversationResponse>>, ApiError> {
    let conversations = support::list(&state, &user).await?;
    Ok(Json(conversations))
}

/// Open a new support conversation with an initial message
pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationResponse>), ApiError> {
    if req.subject.trim().is_empty() {
        return Err(ApiError::bad_request("Subject is required"));
    }
    let conversation = support::create_conversation(&state, &user, &req).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// Fetch one conversation (initiator or admin)
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::get(&state, &user, &id).await?;
    Ok(Json(conversation))
}

/// Append a message; drives claim-on-reply, in_progress and reopen edges
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let (conversation, message) = support::append_message(&state, &user, &id, &req.text).await?;
    Ok(Json(SendMessageResponse {
        conversation,
        message,
    }))
}

/// Claim an unassigned conversation (admin only)
pub async fn claim_conversation(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::claim(&state, &user, &id).await?;
    Ok(Json(conversation))
}

/// Explicit assigned → in_progress transition (admin only)
pub async fn start_progress(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::mark_in_progress(&state, &user, &id).await?;
    Ok(Json(conversation))
}

/// Resolve a conversation (assigned admin only)
pub async fn resolve_conversation(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::resolve(&state, &user, &id).await?;
    Ok(Json(conversation))
}

/// Close a conversation (admin only)
pub async fn close_conversation(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::close(&state, &user, &id).await?;
    Ok(Json(conversation))
}

/// Mark counterparty messages in a conversation as read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = support::mark_read(&state, &user, &id).await?;
    Ok(Json(conversation))
}
