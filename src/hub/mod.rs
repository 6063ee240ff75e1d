//! In-process realtime fanout hub.
//!
//! Owns the room membership table and the per-conversation mutation locks.
//! One instance is created at startup and carried in `AppState`; business
//! logic always receives a handle, there is no global.
//!
//! Delivery is best-effort: a connection whose outbound queue is gone is
//! skipped and pruned, and never affects delivery to other room members.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::db::{ConversationResponse, Message, Notification};

pub type ConnId = u64;

/// Multicast scope for event delivery.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum RoomId {
    /// Personal room, joined automatically at handshake.
    User(String),
    /// Conversation room, joined explicitly when a conversation view opens.
    Conversation(String),
    /// Admin broadcast room, so unassigned admins see new tickets.
    AdminSupport,
}

/// Events pushed from the server to connected clients.
///
/// Names and payload shapes are the wire contract the web clients depend on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "support_message")]
    SupportMessage {
        conversation_id: String,
        message: Message,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
        sender_role: String,
    },
    #[serde(rename = "conversation_updated")]
    ConversationUpdated {
        conversation_id: String,
        conversation: ConversationResponse,
    },
    #[serde(rename = "receiveNotification")]
    ReceiveNotification { notification: Notification },
}

/// Events received from clients over the realtime connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "joinRoom")]
    JoinRoom { user_id: String },
    #[serde(rename = "join_support_room")]
    JoinSupportRoom { conversation_id: String },
    #[serde(rename = "join_admin_support")]
    JoinAdminSupport,
    #[serde(rename = "support_message")]
    SupportMessage {
        conversation_id: String,
        message: String,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
        sender_role: String,
    },
    #[serde(rename = "sendNotification")]
    SendNotification {
        receiver_id: String,
        notification: NotificationPayload,
    },
}

/// Client-supplied notification content for `sendNotification`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
    #[serde(default)]
    pub related_entity_kind: Option<String>,
}

pub struct Hub {
    rooms: DashMap<RoomId, HashMap<ConnId, mpsc::UnboundedSender<ServerEvent>>>,
    /// Single-writer locks keyed by conversation id, so concurrent replies
    /// to one conversation persist and broadcast in the same order.
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            conversation_locks: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id for a newly accepted socket.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn join(&self, room: RoomId, conn: ConnId, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.rooms.entry(room).or_default().insert(conn, tx);
    }

    pub fn leave(&self, room: &RoomId, conn: ConnId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Remove a connection from every room it joined. Called on disconnect.
    pub fn disconnect(&self, conn: ConnId) {
        for mut entry in self.rooms.iter_mut() {
            entry.value_mut().remove(&conn);
        }
        self.rooms.retain(|_, members| !members.is_empty());
    }

    /// Deliver an event to every member of a room.
    pub fn emit(&self, room: &RoomId, event: &ServerEvent) {
        self.emit_inner(room, None, event);
    }

    /// Deliver an event to every room member except one connection,
    /// used for typing relays so senders do not echo themselves.
    pub fn emit_except(&self, room: &RoomId, skip: ConnId, event: &ServerEvent) {
        self.emit_inner(room, Some(skip), event);
    }

    fn emit_inner(&self, room: &RoomId, skip: Option<ConnId>, event: &ServerEvent) {
        let Some(mut members) = self.rooms.get_mut(room) else {
            return;
        };
        let mut dead = Vec::new();
        for (conn, tx) in members.iter() {
            if Some(*conn) == skip {
                continue;
            }
            if tx.send(event.clone()).is_err() {
                dead.push(*conn);
            }
        }
        for conn in dead {
            debug!(conn, ?room, "Pruning closed connection from room");
            members.remove(&conn);
        }
    }

    /// Number of live connections in a room.
    pub fn room_size(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Acquire the mutation lock for a conversation id. Locks for distinct
    /// ids are independent; all writers to one conversation serialize here.
    /// The returned guard removes the table entry on release when no other
    /// writer holds or awaits the same lock, so the table tracks only
    /// conversations with in-flight mutations.
    pub async fn lock_conversation(&self, conversation_id: &str) -> ConversationGuard<'_> {
        let lock = self
            .conversation_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let permit = lock.lock_owned().await;
        ConversationGuard {
            hub: self,
            conversation_id: conversation_id.to_string(),
            permit: Some(permit),
        }
    }

    /// Number of conversations with a live lock entry.
    pub fn lock_table_size(&self) -> usize {
        self.conversation_locks.len()
    }
}

/// Held for the duration of one conversation mutation.
pub struct ConversationGuard<'a> {
    hub: &'a Hub,
    conversation_id: String,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex first so the strong count reflects only the
        // table entry and any waiters still holding clones of the Arc.
        self.permit.take();
        self.hub
            .conversation_locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(conversation_id: &str, text: &str) -> ServerEvent {
        ServerEvent::SupportMessage {
            conversation_id: conversation_id.to_string(),
            message: Message {
                id: "m1".to_string(),
                sender_id: "u1".to_string(),
                sender_name: "Ada".to_string(),
                sender_role: "customer".to_string(),
                text: text.to_string(),
                read: false,
                timestamp: "2026-01-01T00:00:00Z".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn emit_reaches_all_room_members() {
        let hub = Hub::new();
        let room = RoomId::Conversation("c1".to_string());
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.join(room.clone(), 1, tx1);
        hub.join(room.clone(), 2, tx2);

        hub.emit(&room, &text_event("c1", "hello"));

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn emit_except_skips_the_sender() {
        let hub = Hub::new();
        let room = RoomId::Conversation("c1".to_string());
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.join(room.clone(), 1, tx1);
        hub.join(room.clone(), 2, tx2);

        let event = ServerEvent::Typing {
            conversation_id: "c1".to_string(),
            is_typing: true,
            sender_role: "customer".to_string(),
        };
        hub.emit_except(&room, 1, &event);

        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_does_not_block_others() {
        let hub = Hub::new();
        let room = RoomId::Conversation("c1".to_string());
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.join(room.clone(), 1, tx1);
        hub.join(room.clone(), 2, tx2);
        drop(rx1);

        hub.emit(&room, &text_event("c1", "hello"));

        assert!(rx2.recv().await.is_some());
        // The dead member was pruned on that emit
        assert_eq!(hub.room_size(&room), 1);
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.join(RoomId::User("u1".to_string()), 7, tx.clone());
        hub.join(RoomId::Conversation("c1".to_string()), 7, tx.clone());
        hub.join(RoomId::AdminSupport, 7, tx);

        hub.disconnect(7);

        assert_eq!(hub.room_size(&RoomId::User("u1".to_string())), 0);
        assert_eq!(hub.room_size(&RoomId::Conversation("c1".to_string())), 0);
        assert_eq!(hub.room_size(&RoomId::AdminSupport), 0);
    }

    #[tokio::test]
    async fn lock_table_is_pruned_after_release() {
        let hub = Hub::new();
        for i in 0..1000 {
            let guard = hub.lock_conversation(&format!("c{i}")).await;
            assert_eq!(hub.lock_table_size(), 1);
            drop(guard);
        }
        assert_eq!(hub.lock_table_size(), 0);
    }

    #[tokio::test]
    async fn lock_entry_survives_while_a_writer_waits() {
        let hub = Arc::new(Hub::new());
        let first = hub.lock_conversation("c1").await;
        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                let _guard = hub.lock_conversation("c1").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hub.lock_table_size(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(hub.lock_table_size(), 0);
    }

    #[test]
    fn server_events_use_the_wire_names() {
        let json = serde_json::to_value(text_event("c1", "hi")).unwrap();
        assert_eq!(json["event"], "support_message");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["message"]["senderName"], "Ada");

        let json = serde_json::to_value(ServerEvent::Typing {
            conversation_id: "c1".to_string(),
            is_typing: true,
            sender_role: "admin".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "typing");
        assert_eq!(json["isTyping"], true);
        assert_eq!(json["senderRole"], "admin");
    }

    #[test]
    fn client_events_parse_from_the_wire_names() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"join_support_room","conversationId":"c1"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::JoinSupportRoom { conversation_id } if conversation_id == "c1"
        ));

        let event: ClientEvent = serde_json::from_str(r#"{"event":"join_admin_support"}"#).unwrap();
        assert!(matches!(event, ClientEvent::JoinAdminSupport));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"sendNotification","receiverId":"u2","notification":{"title":"Booking","body":"confirmed"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::SendNotification { .. }));
    }
}
