//! Support conversation orchestrator.
//!
//! Every mutation follows the same shape: take the conversation's single
//! writer lock, check authorization, check the status transition, persist,
//! then broadcast. Persistence is authoritative; if nobody is connected the
//! broadcast simply reaches an empty room. The lock guarantees that room
//! members observe messages in exactly the order they were persisted.

use chrono::Utc;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::warn;
use uuid::Uuid;

use crate::db::{
    ConversationResponse, ConversationStatus, CreateConversationRequest, Message, NotificationKind,
    RelatedEntity, Role, SupportConversation, User,
};
use crate::hub::{RoomId, ServerEvent};
use crate::notify::{self, DispatchRequest};
use crate::AppState;

const RETRY_BACKOFF_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum SupportError {
    #[error("Conversation not found")]
    NotFound,
    #[error("Not allowed to act on this conversation")]
    Forbidden,
    #[error("Conversation is assigned to another agent")]
    NotAssigned,
    #[error("Invalid status transition from '{0}'")]
    InvalidTransition(String),
    #[error("Message text must not be empty")]
    EmptyMessage,
    #[error("Storage operation timed out")]
    StorageTimeout,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to encode message list: {0}")]
    Encoding(#[from] serde_json::Error),
}

async fn fetch_once(
    state: &AppState,
    id: &str,
) -> Result<Option<SupportConversation>, SupportError> {
    let window = Duration::from_millis(state.config.storage.write_timeout_ms);
    let query = sqlx::query_as("SELECT * FROM support_conversations WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db);
    match timeout(window, query).await {
        Ok(result) => result.map_err(SupportError::Database),
        Err(_) => Err(SupportError::StorageTimeout),
    }
}

/// Load a conversation, retrying a timed-out read once.
async fn fetch_conversation(state: &AppState, id: &str) -> Result<SupportConversation, SupportError> {
    let fetched = match fetch_once(state, id).await {
        Err(SupportError::StorageTimeout) => {
            sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            fetch_once(state, id).await
        }
        other => other,
    }?;
    fetched.ok_or(SupportError::NotFound)
}

async fn persist_once(state: &AppState, conv: &SupportConversation) -> Result<(), SupportError> {
    let window = Duration::from_millis(state.config.storage.write_timeout_ms);
    let query = sqlx::query(
        r#"
        UPDATE support_conversations
        SET status = ?, assigned_to = ?, assigned_agent_name = ?, messages = ?,
            last_message_at = ?, resolved_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&conv.status)
    .bind(&conv.assigned_to)
    .bind(&conv.assigned_agent_name)
    .bind(&conv.messages)
    .bind(&conv.last_message_at)
    .bind(&conv.resolved_at)
    .bind(&conv.updated_at)
    .bind(&conv.id)
    .execute(&state.db);
    match timeout(window, query).await {
        Ok(result) => result.map(|_| ()).map_err(SupportError::Database),
        Err(_) => Err(SupportError::StorageTimeout),
    }
}

/// Write a conversation back, retrying a timed-out write once. The caller
/// holds the conversation lock, so the retry cannot interleave with another
/// writer.
async fn persist(state: &AppState, conv: &SupportConversation) -> Result<(), SupportError> {
    match persist_once(state, conv).await {
        Err(SupportError::StorageTimeout) => {
            sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            persist_once(state, conv).await
        }
        other => other,
    }
}

fn emit_updated(state: &AppState, conv: &SupportConversation) {
    state.hub.emit(
        &RoomId::Conversation(conv.id.clone()),
        &ServerEvent::ConversationUpdated {
            conversation_id: conv.id.clone(),
            conversation: conv.clone().into(),
        },
    );
}

fn emit_message(state: &AppState, conversation_id: &str, message: &Message) {
    let event = ServerEvent::SupportMessage {
        conversation_id: conversation_id.to_string(),
        message: message.clone(),
    };
    state
        .hub
        .emit(&RoomId::Conversation(conversation_id.to_string()), &event);
    // Unassigned admins watch the broadcast room for new tickets
    state.hub.emit(&RoomId::AdminSupport, &event);
}

fn build_message(actor: &User, text: &str) -> Message {
    Message {
        id: Uuid::new_v4().to_string(),
        sender_id: actor.id.clone(),
        sender_name: actor.public_name(),
        sender_role: actor.role.clone(),
        text: text.to_string(),
        read: false,
        timestamp: Utc::now().to_rfc3339(),
    }
}

async fn insert_once(state: &AppState, conv: &SupportConversation) -> Result<(), SupportError> {
    let window = Duration::from_millis(state.config.storage.write_timeout_ms);
    let insert = sqlx::query(
        r#"
        INSERT INTO support_conversations
            (id, user_id, user_name, user_email, user_role, subject, status,
             assigned_to, assigned_agent_name, priority, messages,
             last_message_at, resolved_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&conv.id)
    .bind(&conv.user_id)
    .bind(&conv.user_name)
    .bind(&conv.user_email)
    .bind(&conv.user_role)
    .bind(&conv.subject)
    .bind(&conv.status)
    .bind(&conv.assigned_to)
    .bind(&conv.assigned_agent_name)
    .bind(&conv.priority)
    .bind(&conv.messages)
    .bind(&conv.last_message_at)
    .bind(&conv.resolved_at)
    .bind(&conv.created_at)
    .bind(&conv.updated_at)
    .execute(&state.db);
    match timeout(window, insert).await {
        Ok(result) => result.map(|_| ()).map_err(SupportError::Database),
        Err(_) => Err(SupportError::StorageTimeout),
    }
}

/// Open a new conversation with its first message. The insert retries a
/// timed-out write once like every other mutation here.
pub async fn create_conversation(
    state: &AppState,
    actor: &User,
    req: &CreateConversationRequest,
) -> Result<ConversationResponse, SupportError> {
    if req.message.trim().is_empty() {
        return Err(SupportError::EmptyMessage);
    }

    let now = Utc::now().to_rfc3339();
    let message = build_message(actor, &req.message);
    let conv = SupportConversation {
        id: Uuid::new_v4().to_string(),
        user_id: actor.id.clone(),
        user_name: actor.public_name(),
        user_email: actor.email.clone(),
        user_role: actor.role.clone(),
        subject: req.subject.clone(),
        status: ConversationStatus::Open.to_string(),
        assigned_to: None,
        assigned_agent_name: None,
        priority: req.priority.clone(),
        messages: serde_json::to_string(&vec![message.clone()])?,
        last_message_at: Some(message.timestamp.clone()),
        resolved_at: None,
        created_at: now.clone(),
        updated_at: now,
    };

    match insert_once(state, &conv).await {
        Err(SupportError::StorageTimeout) => {
            sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            insert_once(state, &conv).await
        }
        other => other,
    }?;

    emit_message(state, &conv.id, &message);
    Ok(conv.into())
}

/// Append a message, driving the status machine as a side effect:
/// claim-on-reply for admins on unclaimed conversations, assigned →
/// in_progress on the first admin reply, and reopen when the initiating
/// user posts after resolution.
pub async fn append_message(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
    text: &str,
) -> Result<(ConversationResponse, Message), SupportError> {
    if text.trim().is_empty() {
        return Err(SupportError::EmptyMessage);
    }

    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    let prev_status = conv.status();
    let mut status = prev_status;
    let is_initiator = conv.user_id == actor.id;
    let mut assignment_changed = false;

    if !is_initiator {
        if actor.role() != Role::Admin {
            return Err(SupportError::Forbidden);
        }
        match conv.assigned_to.as_deref() {
            Some(assignee) if assignee == actor.id => {}
            Some(_) => return Err(SupportError::NotAssigned),
            None => {
                if status == ConversationStatus::Closed {
                    return Err(SupportError::InvalidTransition(status.to_string()));
                }
                // Claim-on-reply: the first admin answer assigns the ticket
                conv.assigned_to = Some(actor.id.clone());
                conv.assigned_agent_name = Some(actor.public_name());
                assignment_changed = true;
            }
        }
    }

    match status {
        ConversationStatus::Closed => {
            if is_initiator {
                // Reopen edge: a new user message revives a closed ticket
                status = ConversationStatus::Open;
                conv.resolved_at = None;
            } else {
                return Err(SupportError::InvalidTransition(status.to_string()));
            }
        }
        ConversationStatus::Resolved if is_initiator => {
            status = ConversationStatus::Open;
            conv.resolved_at = None;
        }
        ConversationStatus::Open | ConversationStatus::Assigned if !is_initiator => {
            status = ConversationStatus::InProgress;
        }
        _ => {}
    }

    let message = build_message(actor, text);
    let mut messages = conv.messages();
    messages.push(message.clone());
    conv.messages = serde_json::to_string(&messages)?;
    conv.status = status.to_string();
    conv.last_message_at = Some(message.timestamp.clone());
    conv.updated_at = Utc::now().to_rfc3339();

    persist(state, &conv).await?;

    emit_message(state, conversation_id, &message);
    if status != prev_status || assignment_changed {
        emit_updated(state, &conv);
    }

    notify_counterparty(state, &conv, actor, text).await;

    Ok((conv.into(), message))
}

/// One notification per message to the other side of the conversation.
/// Best-effort: a failed dispatch never fails the mutation.
async fn notify_counterparty(state: &AppState, conv: &SupportConversation, actor: &User, text: &str) {
    let recipient = if conv.user_id == actor.id {
        conv.assigned_to.clone()
    } else {
        Some(conv.user_id.clone())
    };
    let Some(recipient) = recipient else {
        return;
    };

    let result = notify::dispatch(
        &state.db,
        &state.hub,
        DispatchRequest {
            user_id: recipient,
            kind: NotificationKind::Message,
            title: format!("New message: {}", conv.subject),
            body: text.to_string(),
            related: Some(RelatedEntity {
                id: conv.id.clone(),
                kind: "conversation".to_string(),
            }),
            sender_id: Some(actor.id.clone()),
            sender_name: Some(actor.public_name()),
        },
    )
    .await;
    if let Err(e) = result {
        warn!(conversation = %conv.id, error = %e, "Failed to dispatch message notification");
    }
}

/// Explicitly claim an unassigned conversation (open → assigned).
pub async fn claim(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    if actor.role() != Role::Admin {
        return Err(SupportError::Forbidden);
    }

    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    if conv.status() != ConversationStatus::Open || conv.assigned_to.is_some() {
        return Err(SupportError::InvalidTransition(conv.status.clone()));
    }

    conv.status = ConversationStatus::Assigned.to_string();
    conv.assigned_to = Some(actor.id.clone());
    conv.assigned_agent_name = Some(actor.public_name());
    conv.updated_at = Utc::now().to_rfc3339();

    persist(state, &conv).await?;
    emit_updated(state, &conv);
    Ok(conv.into())
}

/// Explicit assigned → in_progress transition (normally taken implicitly on
/// the first reply).
pub async fn mark_in_progress(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    if actor.role() != Role::Admin {
        return Err(SupportError::Forbidden);
    }

    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    if conv.status() != ConversationStatus::Assigned {
        return Err(SupportError::InvalidTransition(conv.status.clone()));
    }
    if conv.assigned_to.as_deref() != Some(actor.id.as_str()) {
        return Err(SupportError::NotAssigned);
    }

    conv.status = ConversationStatus::InProgress.to_string();
    conv.updated_at = Utc::now().to_rfc3339();

    persist(state, &conv).await?;
    emit_updated(state, &conv);
    Ok(conv.into())
}

/// Resolve a conversation (assigned/in_progress → resolved).
pub async fn resolve(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    if actor.role() != Role::Admin {
        return Err(SupportError::Forbidden);
    }

    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    let status = conv.status();
    if !matches!(
        status,
        ConversationStatus::Assigned | ConversationStatus::InProgress
    ) {
        return Err(SupportError::InvalidTransition(conv.status.clone()));
    }
    if conv.assigned_to.as_deref() != Some(actor.id.as_str()) {
        return Err(SupportError::NotAssigned);
    }

    let now = Utc::now().to_rfc3339();
    conv.status = ConversationStatus::Resolved.to_string();
    conv.resolved_at = Some(now.clone());
    conv.updated_at = now;

    persist(state, &conv).await?;
    emit_updated(state, &conv);

    let result = notify::dispatch(
        &state.db,
        &state.hub,
        DispatchRequest {
            user_id: conv.user_id.clone(),
            kind: NotificationKind::System,
            title: "Support request resolved".to_string(),
            body: format!("Your request \"{}\" was marked resolved.", conv.subject),
            related: Some(RelatedEntity {
                id: conv.id.clone(),
                kind: "conversation".to_string(),
            }),
            sender_id: Some(actor.id.clone()),
            sender_name: Some(actor.public_name()),
        },
    )
    .await;
    if let Err(e) = result {
        warn!(conversation = %conv.id, error = %e, "Failed to dispatch resolve notification");
    }

    Ok(conv.into())
}

/// Close a conversation. Terminal, except that a new message from the
/// initiating user reopens it.
pub async fn close(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    if actor.role() != Role::Admin {
        return Err(SupportError::Forbidden);
    }

    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    if conv.status() == ConversationStatus::Closed {
        return Err(SupportError::InvalidTransition(conv.status.clone()));
    }

    conv.status = ConversationStatus::Closed.to_string();
    conv.updated_at = Utc::now().to_rfc3339();

    persist(state, &conv).await?;
    emit_updated(state, &conv);
    Ok(conv.into())
}

/// Refresh the denormalized agent name on every conversation assigned to a
/// renamed admin, emitting `conversation_updated` per conversation.
///
/// Eventually consistent by design: a rename racing a new assignment is
/// resolved by last write wins, and a single failed row does not stop the
/// sweep. Returns the number of conversations updated.
pub async fn propagate_agent_rename(state: &AppState, admin_id: &str, new_name: &str) -> usize {
    let assigned: Vec<SupportConversation> = match sqlx::query_as(
        "SELECT * FROM support_conversations WHERE assigned_to = ?",
    )
    .bind(admin_id)
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(admin = %admin_id, error = %e, "Failed to list conversations for rename fanout");
            return 0;
        }
    };

    let mut updated = 0;
    for conv in assigned {
        let _guard = state.hub.lock_conversation(&conv.id).await;

        let mut conv = match fetch_conversation(state, &conv.id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(conversation = %conv.id, error = %e, "Skipping conversation in rename fanout");
                continue;
            }
        };
        // Reassigned while we were sweeping; leave it to the new assignee
        if conv.assigned_to.as_deref() != Some(admin_id) {
            continue;
        }
        conv.assigned_agent_name = Some(new_name.to_string());
        conv.updated_at = Utc::now().to_rfc3339();

        if let Err(e) = persist(state, &conv).await {
            warn!(conversation = %conv.id, error = %e, "Failed to persist rename fanout");
            continue;
        }
        emit_updated(state, &conv);
        updated += 1;
    }
    updated
}

/// List conversations: admins see all, users see their own.
pub async fn list(state: &AppState, actor: &User) -> Result<Vec<ConversationResponse>, SupportError> {
    let rows: Vec<SupportConversation> = if actor.is_admin() {
        sqlx::query_as(
            "SELECT * FROM support_conversations ORDER BY last_message_at DESC, created_at DESC",
        )
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as(
            "SELECT * FROM support_conversations WHERE user_id = ? \
             ORDER BY last_message_at DESC, created_at DESC",
        )
        .bind(&actor.id)
        .fetch_all(&state.db)
        .await?
    };
    Ok(rows.into_iter().map(|c| c.into()).collect())
}

/// Fetch one conversation, restricted to the initiator and admins.
pub async fn get(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    let conv = fetch_conversation(state, conversation_id).await?;
    if conv.user_id != actor.id && !actor.is_admin() {
        return Err(SupportError::Forbidden);
    }
    Ok(conv.into())
}

/// Whether a user may join a conversation's realtime room.
pub async fn can_join(state: &AppState, actor: &User, conversation_id: &str) -> bool {
    if actor.is_admin() {
        return true;
    }
    match fetch_conversation(state, conversation_id).await {
        Ok(conv) => conv.user_id == actor.id,
        Err(_) => false,
    }
}

/// Mark every message not sent by the actor as read.
pub async fn mark_read(
    state: &AppState,
    actor: &User,
    conversation_id: &str,
) -> Result<ConversationResponse, SupportError> {
    let _guard = state.hub.lock_conversation(conversation_id).await;

    let mut conv = fetch_conversation(state, conversation_id).await?;
    if conv.user_id != actor.id && !actor.is_admin() {
        return Err(SupportError::Forbidden);
    }

    let mut messages = conv.messages();
    let mut changed = false;
    for message in messages.iter_mut() {
        if message.sender_id != actor.id && !message.read {
            message.read = true;
            changed = true;
        }
    }
    if changed {
        conv.messages = serde_json::to_string(&messages)?;
        conv.updated_at = Utc::now().to_rfc3339();
        persist(state, &conv).await?;
    }
    Ok(conv.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::hub::Hub;
    use crate::session::hash_password;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn test_state() -> AppState {
        let pool = db::init_test().await;
        AppState::new(Config::default(), pool, Arc::new(Hub::new()))
    }

    async fn insert_user(state: &AppState, id: &str, role: &str, display_name: Option<&str>) -> User {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, role, display_name, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("user-{id}"))
        .bind(format!("{id}@example.com"))
        .bind(hash_password("pw").unwrap())
        .bind(role)
        .bind(display_name)
        .bind(&now)
        .bind(&now)
        .execute(&state.db)
        .await
        .unwrap();

        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    fn open_request(subject: &str, message: &str) -> CreateConversationRequest {
        CreateConversationRequest {
            subject: subject.to_string(),
            message: message.to_string(),
            priority: "normal".to_string(),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_claim_resolve_reopen() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Leaky tap", "need help"))
            .await
            .unwrap();
        assert_eq!(conv.status, "open");
        assert_eq!(conv.messages.len(), 1);

        // Claim-on-reply: first admin answer assigns and moves to in_progress
        let (conv, _) = append_message(&state, &sam, &conv.id, "on it").await.unwrap();
        assert_eq!(conv.status, "in_progress");
        assert_eq!(conv.assigned_to.as_deref(), Some("sam"));
        assert_eq!(conv.assigned_agent_name.as_deref(), Some("Sam"));

        let conv = resolve(&state, &sam, &conv.id).await.unwrap();
        assert_eq!(conv.status, "resolved");
        assert!(conv.resolved_at.is_some());

        // A new user message reopens but keeps the assignment
        let (conv, _) = append_message(&state, &ada, &conv.id, "still broken")
            .await
            .unwrap();
        assert_eq!(conv.status, "open");
        assert_eq!(conv.assigned_to.as_deref(), Some("sam"));
        assert!(conv.resolved_at.is_none());
    }

    #[tokio::test]
    async fn resolving_twice_is_an_invalid_transition() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        append_message(&state, &sam, &conv.id, "on it").await.unwrap();
        resolve(&state, &sam, &conv.id).await.unwrap();

        assert!(matches!(
            resolve(&state, &sam, &conv.id).await.unwrap_err(),
            SupportError::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn non_assignee_admin_cannot_reply() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;
        let kim = insert_user(&state, "kim", "admin", Some("Kim")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        let conv = claim(&state, &sam, &conv.id).await.unwrap();
        assert_eq!(conv.status, "assigned");

        assert!(matches!(
            append_message(&state, &kim, &conv.id, "I'll take it")
                .await
                .unwrap_err(),
            SupportError::NotAssigned
        ));
    }

    #[tokio::test]
    async fn strangers_cannot_post_and_claim_is_admin_only() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let bob = insert_user(&state, "bob", "handyman", None).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();

        assert!(matches!(
            append_message(&state, &bob, &conv.id, "hi").await.unwrap_err(),
            SupportError::Forbidden
        ));
        assert!(matches!(
            claim(&state, &bob, &conv.id).await.unwrap_err(),
            SupportError::Forbidden
        ));
    }

    #[tokio::test]
    async fn claiming_an_assigned_conversation_fails() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;
        let kim = insert_user(&state, "kim", "admin", Some("Kim")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        claim(&state, &sam, &conv.id).await.unwrap();

        assert!(matches!(
            claim(&state, &kim, &conv.id).await.unwrap_err(),
            SupportError::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn closed_rejects_admin_appends_but_user_reopens() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        append_message(&state, &sam, &conv.id, "on it").await.unwrap();
        let conv = close(&state, &sam, &conv.id).await.unwrap();
        assert_eq!(conv.status, "closed");

        assert!(matches!(
            append_message(&state, &sam, &conv.id, "anything else?")
                .await
                .unwrap_err(),
            SupportError::InvalidTransition(_)
        ));

        let (conv, _) = append_message(&state, &ada, &conv.id, "it broke again")
            .await
            .unwrap();
        assert_eq!(conv.status, "open");
        assert_eq!(conv.assigned_to.as_deref(), Some("sam"));
    }

    #[tokio::test]
    async fn broadcast_order_matches_persisted_order() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "first"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .hub
            .join(RoomId::Conversation(conv.id.clone()), 1, tx);

        append_message(&state, &sam, &conv.id, "second").await.unwrap();
        append_message(&state, &ada, &conv.id, "third").await.unwrap();
        append_message(&state, &sam, &conv.id, "fourth").await.unwrap();

        let mut observed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::SupportMessage { message, .. } = event {
                observed.push(message.text);
            }
        }
        assert_eq!(observed, vec!["second", "third", "fourth"]);

        let stored = get(&state, &sam, &conv.id).await.unwrap();
        let stored_texts: Vec<_> = stored.messages.iter().map(|m| m.text.clone()).collect();
        assert_eq!(stored_texts, vec!["first", "second", "third", "fourth"]);
    }

    #[tokio::test]
    async fn messages_reach_the_admin_broadcast_room() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.hub.join(RoomId::AdminSupport, 1, tx);

        create_conversation(&state, &ada, &open_request("Subject", "need help"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ServerEvent::SupportMessage { message, .. } => assert_eq!(message.text, "need help"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rename_fanout_touches_every_assigned_conversation() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let c1 = create_conversation(&state, &ada, &open_request("First", "help"))
            .await
            .unwrap();
        let c2 = create_conversation(&state, &ada, &open_request("Second", "help again"))
            .await
            .unwrap();
        append_message(&state, &sam, &c1.id, "on it").await.unwrap();
        append_message(&state, &sam, &c2.id, "on it too").await.unwrap();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        state.hub.join(RoomId::Conversation(c1.id.clone()), 1, tx1);
        state.hub.join(RoomId::Conversation(c2.id.clone()), 2, tx2);

        let updated = propagate_agent_rename(&state, "sam", "Samantha").await;
        assert_eq!(updated, 2);

        for (conv_id, rx) in [(&c1.id, &mut rx1), (&c2.id, &mut rx2)] {
            let event = rx.recv().await.unwrap();
            match event {
                ServerEvent::ConversationUpdated {
                    conversation_id,
                    conversation,
                } => {
                    assert_eq!(&conversation_id, conv_id);
                    assert_eq!(conversation.assigned_agent_name.as_deref(), Some("Samantha"));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn users_only_list_their_own_conversations() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let bob = insert_user(&state, "bob", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        create_conversation(&state, &ada, &open_request("A", "help"))
            .await
            .unwrap();
        create_conversation(&state, &bob, &open_request("B", "help"))
            .await
            .unwrap();

        assert_eq!(list(&state, &ada).await.unwrap().len(), 1);
        assert_eq!(list(&state, &sam).await.unwrap().len(), 2);

        let bobs = list(&state, &bob).await.unwrap();
        assert!(matches!(
            get(&state, &ada, &bobs[0].id).await.unwrap_err(),
            SupportError::Forbidden
        ));
    }

    #[tokio::test]
    async fn mark_read_flips_only_counterparty_messages() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        append_message(&state, &sam, &conv.id, "on it").await.unwrap();

        let conv = mark_read(&state, &ada, &conv.id).await.unwrap();
        let by_sender: Vec<_> = conv
            .messages
            .iter()
            .map(|m| (m.sender_id.clone(), m.read))
            .collect();
        assert_eq!(
            by_sender,
            vec![("ada".to_string(), false), ("sam".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn disconnected_viewer_does_not_lose_the_mutation() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();

        // The viewer's outbound queue is gone before the mutation lands
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .hub
            .join(RoomId::Conversation(conv.id.clone()), 1, tx);
        drop(rx);

        append_message(&state, &sam, &conv.id, "on it").await.unwrap();

        let stored = get(&state, &sam, &conv.id).await.unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].text, "on it");
    }

    #[tokio::test]
    async fn message_appends_notify_the_counterparty() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let sam = insert_user(&state, "sam", "admin", Some("Sam")).await;

        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();
        append_message(&state, &sam, &conv.id, "on it").await.unwrap();
        append_message(&state, &ada, &conv.id, "thanks").await.unwrap();

        let for_ada: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = 'ada'")
                .fetch_one(&state.db)
                .await
                .unwrap();
        let for_sam: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = 'sam'")
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(for_ada.0, 1);
        assert_eq!(for_sam.0, 1);
    }

    #[tokio::test]
    async fn stalled_insert_surfaces_timeout_after_one_retry() {
        let mut state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        state.config.storage.write_timeout_ms = 0;

        let started = std::time::Instant::now();
        let err = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap_err();

        assert!(matches!(err, SupportError::StorageTimeout));
        // The second attempt only runs after the backoff, so the failure
        // cannot surface before one backoff has elapsed
        assert!(started.elapsed() >= Duration::from_millis(RETRY_BACKOFF_MS));
    }

    #[tokio::test]
    async fn stalled_update_surfaces_timeout_to_the_sender() {
        let mut state = test_state().await;
        let ada = insert_user(&state, "ada", "customer", None).await;
        let conv = create_conversation(&state, &ada, &open_request("Subject", "help"))
            .await
            .unwrap();

        state.config.storage.write_timeout_ms = 0;
        let err = append_message(&state, &ada, &conv.id, "still there?")
            .await
            .unwrap_err();
        assert!(matches!(err, SupportError::StorageTimeout));
    }
}
