//! Bearer-token session management.
//!
//! A login mints two things: an opaque per-user session secret persisted on
//! the user row with a sliding expiry, and a signed bearer token embedding
//! that secret. A token is only accepted while its embedded secret matches
//! the user's current one, so rotating or clearing the secret invalidates
//! every outstanding token at once without a revocation list.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::db::{DbPool, User};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid or expired credential")]
    Unauthorized,
    #[error("Session has been revoked")]
    SessionRevoked,
    #[error("Session has expired")]
    SessionExpired,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account has no local password; use the external login flow")]
    NoLocalCredential,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Bearer token claims. `sid` is the embedded session secret checked
/// against the user row on every validation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Generate a random session secret (256 bits, hex encoded)
fn generate_secret() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Issue a new session for a user: rotates the stored session secret,
/// extends the server-side expiry, and mints a signed bearer token.
///
/// Rotation means a login from a second device invalidates tokens issued
/// to the first.
pub async fn issue(
    pool: &DbPool,
    token_key: &str,
    ttl_minutes: i64,
    user: &User,
) -> Result<String, AuthError> {
    let secret = generate_secret();
    let now = Utc::now();
    let expires_at = now + Duration::minutes(ttl_minutes);

    sqlx::query(
        "UPDATE users SET session_secret = ?, session_expires_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&secret)
    .bind(expires_at.to_rfc3339())
    .bind(now.to_rfc3339())
    .bind(&user.id)
    .execute(pool)
    .await?;

    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        sid: secret,
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(token_key.as_bytes()),
    )
    .map_err(|_| AuthError::Unauthorized)
}

/// Validate a bearer token and load its user.
///
/// Read-only: does not refresh the server-side expiry. A valid signature is
/// not enough; the embedded secret must match the user's current one and
/// the server-side expiry must not have passed.
pub async fn validate(pool: &DbPool, token_key: &str, token: &str) -> Result<User, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(token_key.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::Unauthorized)?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&data.claims.sub)
        .fetch_optional(pool)
        .await?;

    // A valid token for a missing user reads the same as a bad token
    let user = user.ok_or(AuthError::Unauthorized)?;

    let current = user
        .session_secret
        .as_deref()
        .ok_or(AuthError::SessionRevoked)?;

    let claimed = data.claims.sid.as_bytes();
    let stored = current.as_bytes();
    if claimed.len() != stored.len() || !bool::from(claimed.ct_eq(stored)) {
        return Err(AuthError::SessionRevoked);
    }

    let expires_at = user
        .session_expires_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .ok_or(AuthError::SessionRevoked)?;
    if Utc::now() > expires_at {
        return Err(AuthError::SessionExpired);
    }

    Ok(user)
}

/// Revoke a user's session, invalidating every outstanding bearer token.
pub async fn revoke(pool: &DbPool, user_id: &str) -> Result<(), AuthError> {
    sqlx::query(
        "UPDATE users SET session_secret = NULL, session_expires_at = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Check a login attempt against the stored password hash.
pub fn check_password(user: &User, password: &str) -> Result<(), AuthError> {
    let hash = user
        .password_hash
        .as_deref()
        .ok_or(AuthError::NoLocalCredential)?;
    if verify_password(password, hash) {
        Ok(())
    } else {
        Err(AuthError::InvalidCredentials)
    }
}
