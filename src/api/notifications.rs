//! Notification endpoints: recipients list and acknowledge their own
//! notifications. Creation happens through the dispatcher, not over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{Notification, User};
use crate::AppState;

use super::error::ApiError;

/// List the authenticated user's notifications, newest first
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let notifications: Vec<Notification> = sqlx::query_as(
        "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(notifications))
}

/// Mark one notification as read; recipients only
pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let notification: Option<Notification> =
        sqlx::query_as("SELECT * FROM notifications WHERE id = ?")
            .bind(&id)
            .fetch_optional(&state.db)
            .await?;
    let notification = notification.ok_or_else(|| ApiError::not_found("Notification not found"))?;

    if notification.user_id != user.id {
        return Err(ApiError::forbidden("Not your notification"));
    }

    sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    Ok(Json(Notification {
        read: true,
        ..notification
    }))
}

/// Mark all of the authenticated user's notifications as read
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<StatusCode, ApiError> {
    sqlx::query("UPDATE notifications SET read = 1 WHERE user_id = ?")
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
