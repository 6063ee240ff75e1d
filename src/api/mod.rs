pub mod auth;
mod conversations;
pub mod error;
mod notifications;
mod ws;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Auth routes (public; logout/validate check the token themselves)
    let auth_routes = Router::new()
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/validate", get(auth::validate))
        .route("/display-name", put(auth::update_display_name));

    let conversation_routes = Router::new()
        .route(
            "/",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/:id", get(conversations::get_conversation))
        .route("/:id/messages", post(conversations::send_message))
        .route("/:id/claim", post(conversations::claim_conversation))
        .route("/:id/progress", post(conversations::start_progress))
        .route("/:id/resolve", post(conversations::resolve_conversation))
        .route("/:id/close", post(conversations::close_conversation))
        .route("/:id/read", post(conversations::mark_read));

    let notification_routes = Router::new()
        .route("/", get(notifications::list_notifications))
        .route("/read-all", post(notifications::mark_all_read))
        .route("/:id/read", post(notifications::mark_notification_read));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/auth", auth_routes)
        .nest("/api/support/conversations", conversation_routes)
        .nest("/api/notifications", notification_routes)
        // WebSocket handles its own auth via query param
        .route("/api/ws", get(ws::realtime_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
