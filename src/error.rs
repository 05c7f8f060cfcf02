use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::{repository::RepositoryError, storage::StorageError};

/// ApiError
///
/// The single error type returned by handlers and extractors. Every variant maps to
/// one HTTP status and renders as `{"detail": "..."}` so clients can show the message
/// as-is.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input or a business rule violation (duplicate plate, unknown role...).
    #[error("{0}")]
    BadRequest(String),

    /// Missing, malformed or expired credentials.
    #[error("Could not validate credentials")]
    Unauthorized,

    /// Wrong username or password at login.
    #[error("Incorrect username or password")]
    InvalidCredentials,

    /// Authenticated, but the resolved permissions do not allow the action.
    #[error("{0}")]
    Forbidden(String),

    /// The account is temporarily locked after repeated failed logins.
    #[error("User is locked until {0} UTC")]
    Locked(DateTime<Utc>),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests, try again later")]
    RateLimited,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Locked(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Repository(_) | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal failures are logged here and replaced by a generic message.
        let detail = match &self {
            Self::Repository(_) | Self::Storage(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                "Internal server error".to_string()
            }
            Self::Locked(until) => {
                format!("User is locked until {} UTC", until.format("%Y-%m-%d %H:%M:%S"))
            }
            other => other.to_string(),
        };

        let body = Json(json!({ "detail": detail }));

        if status == StatusCode::UNAUTHORIZED {
            return (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response();
        }
        (status, body).into_response()
    }
}
