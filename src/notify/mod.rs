//! Notification dispatch: persist a record, then push it to the
//! recipient's personal room.
//!
//! The dispatcher does not deduplicate; callers that want one notification
//! per event get exactly that, repeated calls create repeated records.

use chrono::Utc;
use uuid::Uuid;

use crate::db::{DbPool, Notification, NotificationKind, RelatedEntity};
use crate::hub::{Hub, RoomId, ServerEvent};

pub struct DispatchRequest {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub related: Option<RelatedEntity>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
}

/// Persist a notification and emit `receiveNotification` to the recipient's
/// personal room. The write is authoritative; delivery is best-effort.
pub async fn dispatch(
    pool: &DbPool,
    hub: &Hub,
    req: DispatchRequest,
) -> Result<Notification, sqlx::Error> {
    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        user_id: req.user_id,
        title: req.title,
        body: req.body,
        kind: req.kind.to_string(),
        related_entity_id: req.related.as_ref().map(|r| r.id.clone()),
        related_entity_kind: req.related.as_ref().map(|r| r.kind.clone()),
        sender_id: req.sender_id,
        sender_name: req.sender_name,
        read: false,
        created_at: Utc::now().to_rfc3339(),
    };

    sqlx::query(
        r#"
        INSERT INTO notifications
            (id, user_id, title, body, kind, related_entity_id, related_entity_kind,
             sender_id, sender_name, read, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&notification.id)
    .bind(&notification.user_id)
    .bind(&notification.title)
    .bind(&notification.body)
    .bind(&notification.kind)
    .bind(&notification.related_entity_id)
    .bind(&notification.related_entity_kind)
    .bind(&notification.sender_id)
    .bind(&notification.sender_name)
    .bind(notification.read)
    .bind(&notification.created_at)
    .execute(pool)
    .await?;

    hub.emit(
        &RoomId::User(notification.user_id.clone()),
        &ServerEvent::ReceiveNotification {
            notification: notification.clone(),
        },
    );

    Ok(notification)
}
