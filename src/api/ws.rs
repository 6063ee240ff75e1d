//! Realtime connection endpoint.
//!
//! The handshake authenticates with a bearer token passed as a query
//! parameter (browsers cannot set headers on WebSocket upgrades) and joins
//! the connection to its user's personal room. Everything after that is
//! event-driven: the client joins rooms and sends chat traffic, the hub
//! pushes fanout events through the connection's outbound queue.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::{NotificationKind, RelatedEntity, User};
use crate::hub::{ClientEvent, ConnId, RoomId, ServerEvent};
use crate::notify::{self, DispatchRequest};
use crate::session;
use crate::support;
use crate::AppState;

#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

/// WebSocket endpoint for realtime chat and notifications
/// GET /api/ws?token=...
pub async fn realtime_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsAuthQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query.token.as_deref().ok_or(StatusCode::UNAUTHORIZED)?;
    let user = session::validate(&state.db, &state.config.auth.token_key, token)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, user)))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, user: User) {
    let (mut sender, mut receiver) = socket.split();
    let conn = state.hub.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Personal room membership starts at the handshake
    state
        .hub
        .join(RoomId::User(user.id.clone()), conn, tx.clone());
    debug!(user = %user.id, conn, "Realtime connection established");

    loop {
        tokio::select! {
            // Fanout events queued for this connection
            event = rx.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize server event");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }

            // Inbound client events. Handled inline, so a mutation that has
            // started always runs to completion even if the peer goes away.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = handle_client_event(&state, &user, conn, &tx, &text).await {
                            let error_payload = serde_json::json!({
                                "event": "error",
                                "message": e,
                            });
                            if sender
                                .send(WsMessage::Text(error_payload.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Leaving every room is immediate; broadcasts already in flight simply
    // skip this connection.
    state.hub.disconnect(conn);
    debug!(user = %user.id, conn, "Realtime connection closed");
}

async fn handle_client_event(
    state: &Arc<AppState>,
    user: &User,
    conn: ConnId,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) -> Result<(), String> {
    let event: ClientEvent =
        serde_json::from_str(text).map_err(|e| format!("Unrecognized event: {}", e))?;

    match event {
        ClientEvent::JoinRoom { user_id } => {
            // A connection may only (re)join its own personal room
            if user_id == user.id {
                state.hub.join(RoomId::User(user_id), conn, tx.clone());
            } else {
                warn!(user = %user.id, requested = %user_id, "Rejected personal room join");
            }
        }
        ClientEvent::JoinSupportRoom { conversation_id } => {
            if support::can_join(state, user, &conversation_id).await {
                state
                    .hub
                    .join(RoomId::Conversation(conversation_id), conn, tx.clone());
            } else {
                return Err("Not allowed to join this conversation".to_string());
            }
        }
        ClientEvent::JoinAdminSupport => {
            if user.is_admin() {
                state.hub.join(RoomId::AdminSupport, conn, tx.clone());
            } else {
                return Err("Admin role required".to_string());
            }
        }
        ClientEvent::SupportMessage {
            conversation_id,
            message,
        } => {
            support::append_message(state, user, &conversation_id, &message)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientEvent::Typing {
            conversation_id,
            is_typing,
            ..
        } => {
            // Same authorization as joining the room the indicator lands in
            if !support::can_join(state, user, &conversation_id).await {
                return Err("Not allowed to signal in this conversation".to_string());
            }
            // Ephemeral relay: never persisted, sender excluded, role taken
            // from the session rather than the client payload
            state.hub.emit_except(
                &RoomId::Conversation(conversation_id.clone()),
                conn,
                &ServerEvent::Typing {
                    conversation_id,
                    is_typing,
                    sender_role: user.role.clone(),
                },
            );
        }
        ClientEvent::SendNotification {
            receiver_id,
            notification,
        } => {
            let kind = notification
                .kind
                .as_deref()
                .and_then(|k| k.parse::<NotificationKind>().ok())
                .unwrap_or(NotificationKind::Other);
            let related = notification.related_entity_id.as_ref().map(|id| RelatedEntity {
                id: id.clone(),
                kind: notification
                    .related_entity_kind
                    .clone()
                    .unwrap_or_else(|| "other".to_string()),
            });
            notify::dispatch(
                &state.db,
                &state.hub,
                DispatchRequest {
                    user_id: receiver_id,
                    kind,
                    title: notification.title,
                    body: notification.body,
                    related,
                    sender_id: Some(user.id.clone()),
                    sender_name: Some(user.public_name()),
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{self, CreateConversationRequest};
    use crate::hub::Hub;
    use crate::session::hash_password;
    use chrono::Utc;

    async fn test_state() -> Arc<AppState> {
        let pool = db::init_test().await;
        Arc::new(AppState::new(Config::default(), pool, Arc::new(Hub::new())))
    }

    async fn insert_user(state: &AppState, id: &str, role: &str) -> User {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, role, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("user-{id}"))
        .bind(format!("{id}@example.com"))
        .bind(hash_password("pw").unwrap())
        .bind(role)
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

    async fn open_conversation(state: &AppState, actor: &User) -> String {
        support::create_conversation(
            state,
            actor,
            &CreateConversationRequest {
                subject: "Subject".to_string(),
                message: "help".to_string(),
                priority: "normal".to_string(),
            },
        )
        .await
        .unwrap()
        .id
    }

    fn typing_frame(conversation_id: &str) -> String {
        format!(
            r#"{{"event":"typing","conversationId":"{}","isTyping":true,"senderRole":"admin"}}"#,
            conversation_id
        )
    }

    #[tokio::test]
    async fn typing_from_an_outsider_is_rejected() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer").await;
        let eve = insert_user(&state, "eve", "customer").await;
        let conv_id = open_conversation(&state, &ada).await;

        let (ada_tx, mut ada_rx) = mpsc::unbounded_channel();
        state
            .hub
            .join(RoomId::Conversation(conv_id.clone()), 1, ada_tx);

        let (eve_tx, _eve_rx) = mpsc::unbounded_channel();
        let result = handle_client_event(&state, &eve, 2, &eve_tx, &typing_frame(&conv_id)).await;

        assert!(result.is_err());
        assert!(ada_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_from_a_participant_reaches_the_room() {
        let state = test_state().await;
        let ada = insert_user(&state, "ada", "customer").await;
        let sam = insert_user(&state, "sam", "admin").await;
        let conv_id = open_conversation(&state, &ada).await;

        let (sam_tx, mut sam_rx) = mpsc::unbounded_channel();
        state
            .hub
            .join(RoomId::Conversation(conv_id.clone()), 1, sam_tx);

        let (ada_tx, _ada_rx) = mpsc::unbounded_channel();
        handle_client_event(&state, &ada, 2, &ada_tx, &typing_frame(&conv_id))
            .await
            .unwrap();

        match sam_rx.try_recv().unwrap() {
            ServerEvent::Typing { sender_role, is_typing, .. } => {
                // Role comes from the session, not the client payload
                assert_eq!(sender_role, "customer");
                assert!(is_typing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
