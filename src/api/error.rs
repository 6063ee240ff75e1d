//! Unified API error handling.
//!
//! All endpoints return errors in a standard JSON envelope with a
//! machine-readable code and an appropriate HTTP status. Authorization and
//! transition errors are deterministic and surface verbatim; storage
//! timeouts surface as 503 after the orchestrator's single retry.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::session::AuthError;
use crate::support::SupportError;

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    DuplicateEmail,
    NoLocalCredential,
    InvalidTransition,
    ValidationError,

    // Server errors (5xx)
    InternalError,
    DatabaseError,
    StorageTimeout,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::DuplicateEmail => StatusCode::CONFLICT,
            ErrorCode::NoLocalCredential => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidTransition => StatusCode::CONFLICT,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::DuplicateEmail => "duplicate_email",
            ErrorCode::NoLocalCredential => "no_local_credential",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::DatabaseError => "database_error",
            ErrorCode::StorageTimeout => "storage_timeout",
        }
    }
}

/// The inner error object in the response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// The full error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Unified API error type
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Create a new API error with a specific code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.message,
            },
        };

        (self.status, Json(response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {}", err);

        match &err {
            sqlx::Error::RowNotFound => ApiError::not_found("Resource not found"),
            sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed") => {
                ApiError::new(ErrorCode::DuplicateEmail, "An account with this email already exists")
            }
            _ => ApiError::database("A database error occurred"),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            // Revoked and expired sessions read the same as any other bad
            // credential to outside callers
            AuthError::Unauthorized | AuthError::SessionRevoked | AuthError::SessionExpired => {
                ApiError::unauthorized("Invalid or expired credential")
            }
            AuthError::InvalidCredentials => ApiError::unauthorized("Invalid credentials"),
            AuthError::NoLocalCredential => ApiError::new(
                ErrorCode::NoLocalCredential,
                "This account has no password; use the external login flow",
            ),
            AuthError::Database(e) => e.into(),
        }
    }
}

impl From<SupportError> for ApiError {
    fn from(err: SupportError) -> Self {
        match err {
            SupportError::NotFound => ApiError::not_found("Conversation not found"),
            SupportError::Forbidden => {
                ApiError::forbidden("Not allowed to act on this conversation")
            }
            SupportError::NotAssigned => {
                ApiError::forbidden("Conversation is assigned to another agent")
            }
            SupportError::InvalidTransition(from) => ApiError::new(
                ErrorCode::InvalidTransition,
                format!("Invalid status transition from '{}'", from),
            ),
            SupportError::EmptyMessage => {
                ApiError::new(ErrorCode::ValidationError, "Message text must not be empty")
            }
            SupportError::StorageTimeout => {
                ApiError::new(ErrorCode::StorageTimeout, "Storage operation timed out")
            }
            SupportError::Database(e) => e.into(),
            SupportError::Encoding(_) => ApiError::internal("Failed to encode message list"),
        }
    }
}
