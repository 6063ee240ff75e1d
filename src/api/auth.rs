//! Account and session endpoints: signup, login, logout, token validation,
//! and the admin display-name update that fans out to assigned conversations.

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{
    LoginRequest, LoginResponse, Role, SignupRequest, UpdateDisplayNameRequest, User, UserResponse,
};
use crate::session;
use crate::support;
use crate::AppState;

use super::error::{ApiError, ErrorCode};

fn validate_password_strength(password: &str) -> Option<String> {
    if password.len() < 8 {
        return Some("Password must be at least 8 characters".to_string());
    }
    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Some("Password must contain at least one letter and one digit".to_string());
    }
    None
}

/// Register a new account and start a session for it.
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    if req.username.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationError, "Username is required"));
    }
    if req.email.is_empty() || !req.email.contains('@') {
        return Err(ApiError::new(ErrorCode::ValidationError, "Invalid email address"));
    }
    if let Some(error) = validate_password_strength(&req.password) {
        return Err(ApiError::new(ErrorCode::ValidationError, error));
    }

    let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&req.email)
        .fetch_optional(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::new(
            ErrorCode::DuplicateEmail,
            "An account with this email already exists",
        ));
    }

    let id = Uuid::new_v4().to_string();
    let password_hash = session::hash_password(&req.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;
    let now = Utc::now().to_rfc3339();

    // The UNIQUE constraint on email still backstops a concurrent signup race
    sqlx::query(
        "INSERT INTO users (id, username, email, password_hash, role, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&req.username)
    .bind(&req.email)
    .bind(&password_hash)
    .bind(req.role.to_string())
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;

    tracing::info!(user = %user.id, role = %user.role, "New account registered");

    let token = session::issue(
        &state.db,
        &state.config.auth.token_key,
        state.config.auth.session_ttl_minutes,
        &user,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(LoginResponse {
            token,
            user: user.into(),
        }),
    ))
}

/// Login endpoint. Issues a fresh session secret, which invalidates every
/// token from earlier logins on other devices.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&req.email)
        .fetch_optional(&state.db)
        .await?;

    let user = user.ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;
    session::check_password(&user, &req.password)?;

    let token = session::issue(
        &state.db,
        &state.config.auth.token_key,
        state.config.auth.session_ttl_minutes,
        &user,
    )
    .await?;

    Ok(Json(LoginResponse {
        token,
        user: user.into(),
    }))
}

/// Logout: clears the session secret, instantly invalidating all
/// outstanding tokens for this user.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<StatusCode, ApiError> {
    session::revoke(&state.db, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate the presented token and return the account it belongs to.
pub async fn validate(user: User) -> Json<UserResponse> {
    Json(user.into())
}

/// Update an admin's display name and refresh the denormalized agent name
/// on every conversation assigned to them.
pub async fn update_display_name(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(req): Json<UpdateDisplayNameRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if user.role() != Role::Admin {
        return Err(ApiError::forbidden("Only admins have display names"));
    }
    let name = req.display_name.trim();
    if name.is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationError, "Display name is required"));
    }

    sqlx::query("UPDATE users SET display_name = ?, updated_at = ? WHERE id = ?")
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(&user.id)
        .execute(&state.db)
        .await?;

    let updated = support::propagate_agent_rename(&state, &user.id, name).await;
    tracing::info!(admin = %user.id, conversations = updated, "Agent display name propagated");

    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&user.id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(user.into()))
}

fn extract_bearer(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Extractor for the current authenticated user.
#[async_trait]
impl FromRequestParts<Arc<AppState>> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
        session::validate(&state.db, &state.config.auth.token_key, token)
            .await
            .map_err(ApiError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::hub::Hub;

    async fn test_state() -> Arc<AppState> {
        let pool = db::init_test().await;
        Arc::new(AppState::new(Config::default(), pool, Arc::new(Hub::new())))
    }

    fn signup_request(email: &str) -> SignupRequest {
        SignupRequest {
            username: "ada".to_string(),
            email: email.to_string(),
            password: "sturdy-pass1".to_string(),
            role: Role::Customer,
        }
    }

    #[tokio::test]
    async fn signup_then_login_round_trip() {
        let state = test_state().await;

        let (status, Json(created)) =
            signup(State(state.clone()), Json(signup_request("a@example.com")))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.user.role, "customer");

        let Json(logged_in) = login(
            State(state.clone()),
            Json(LoginRequest {
                email: "a@example.com".to_string(),
                password: "sturdy-pass1".to_string(),
            }),
        )
        .await
        .unwrap();

        let user = session::validate(&state.db, &state.config.auth.token_key, &logged_in.token)
            .await
            .unwrap();
        assert_eq!(user.email, "a@example.com");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let state = test_state().await;
        signup(State(state.clone()), Json(signup_request("a@example.com")))
            .await
            .unwrap();

        let err = signup(State(state.clone()), Json(signup_request("a@example.com")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate_email"));
    }

    #[tokio::test]
    async fn login_with_wrong_password_fails_generically() {
        let state = test_state().await;
        signup(State(state.clone()), Json(signup_request("a@example.com")))
            .await
            .unwrap();

        let err = login(
            State(state.clone()),
            Json(LoginRequest {
                email: "a@example.com".to_string(),
                password: "wrong-pass1".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
    }

    #[tokio::test]
    async fn logout_revokes_the_session() {
        let state = test_state().await;
        let (_, Json(created)) =
            signup(State(state.clone()), Json(signup_request("a@example.com")))
                .await
                .unwrap();

        let user = session::validate(&state.db, &state.config.auth.token_key, &created.token)
            .await
            .unwrap();
        logout(State(state.clone()), user).await.unwrap();

        assert!(
            session::validate(&state.db, &state.config.auth.token_key, &created.token)
                .await
                .is_err()
        );
    }
}
