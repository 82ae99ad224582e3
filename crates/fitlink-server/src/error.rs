use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use fitlink_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable code, shared by HTTP bodies and realtime
    /// `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::NotFound(_) => "not_found",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::Conflict(_) => "conflict",
            ServerError::Validation(_) => "validation_error",
            ServerError::Authentication(_) => "authentication_error",
            ServerError::RateLimited => "rate_limited",
            ServerError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the client. Internal details stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound(_) | StoreError::MessageNotFound(_) => {
                ServerError::NotFound(e.to_string())
            }
            StoreError::Forbidden(msg) => ServerError::Forbidden(msg),
            StoreError::ConversationBlocked(_) => ServerError::Conflict(e.to_string()),
            StoreError::Conflict(msg) => ServerError::Conflict(msg),
            StoreError::Validation(msg) => ServerError::Validation(msg),
            other => {
                tracing::error!(error = %other, "store failure");
                ServerError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
