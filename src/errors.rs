use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::anki::AnkiError;
use crate::apkg::ApkgError;
use crate::auth::JwtError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Invalid or missing token")]
    TokenInvalid,
    #[error("Token has been revoked")]
    TokenRevoked,
    #[error("Account is inactive")]
    AccountInactive,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Cannot change card status from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Invalid deck hierarchy: {0}")]
    DeckCycle(String),
    #[error("Job in status {0} cannot be cancelled")]
    JobNotCancellable(String),
    #[error("LLM service error: {0}")]
    Llm(String),
    #[error("LLM service unavailable: {0}")]
    LlmUnavailable(String),
    #[error("AnkiConnect error: {0}")]
    Anki(String),
    #[error("AnkiConnect unavailable: {0}")]
    AnkiUnavailable(String),
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable error code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentials => "AUTH_001",
            ApiError::TokenExpired => "AUTH_002",
            ApiError::TokenInvalid => "AUTH_003",
            ApiError::TokenRevoked => "AUTH_004",
            ApiError::AccountInactive => "AUTH_005",
            ApiError::PermissionDenied(_) => "PERM_001",
            ApiError::NotFound(_) => "RES_001",
            ApiError::Validation(_) => "VAL_001",
            ApiError::Conflict(_) => "CONF_001",
            ApiError::InvalidTransition { .. } => "CARD_001",
            ApiError::DeckCycle(_) => "DECK_001",
            ApiError::JobNotCancellable(_) => "GEN_001",
            ApiError::Llm(_) => "LLM_001",
            ApiError::LlmUnavailable(_) => "LLM_002",
            ApiError::Anki(_) => "SYNC_001",
            ApiError::AnkiUnavailable(_) => "SYNC_002",
            ApiError::RateLimited { .. } => "RATE_001",
            ApiError::Database(_) => "DB_001",
            ApiError::Internal(_) => "INT_001",
        }
    }

    /// HTTP status the error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentials
            | ApiError::TokenExpired
            | ApiError::TokenInvalid
            | ApiError::TokenRevoked => StatusCode::UNAUTHORIZED,
            ApiError::AccountInactive | ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidTransition { .. }
            | ApiError::DeckCycle(_)
            | ApiError::JobNotCancellable(_) => StatusCode::BAD_REQUEST,
            ApiError::Llm(_) | ApiError::Anki(_) => StatusCode::BAD_GATEWAY,
            ApiError::LlmUnavailable(_) | ApiError::AnkiUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, details) = match &self {
            ApiError::Database(err) => {
                error!("Database error: {:#}", err);
                ("Internal server error".to_string(), None)
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                ("Internal server error".to_string(), None)
            }
            ApiError::InvalidTransition { from, to } => (
                self.to_string(),
                Some(json!({ "from": from, "to": to })),
            ),
            ApiError::RateLimited { retry_after } => (
                "Too many requests".to_string(),
                Some(json!({ "retry_after": retry_after })),
            ),
            _ => (self.to_string(), None),
        };

        let mut error_body = json!({
            "code": code,
            "message": message,
        });
        if let Some(details) = details {
            error_body["details"] = details;
        }

        let mut response = (status, Json(json!({ "error": error_body }))).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => ApiError::TokenExpired,
            JwtError::Invalid | JwtError::WrongType { .. } => ApiError::TokenInvalid,
            JwtError::Jwt(err) => ApiError::Internal(format!("token signing failed: {err}")),
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(_) | LlmError::Timeout => ApiError::LlmUnavailable(err.to_string()),
            LlmError::RateLimited(retry_after) => ApiError::RateLimited {
                retry_after: retry_after.unwrap_or(60),
            },
            other => ApiError::Llm(other.to_string()),
        }
    }
}

impl From<AnkiError> for ApiError {
    fn from(err: AnkiError) -> Self {
        match err {
            AnkiError::Unavailable(_) => ApiError::AnkiUnavailable(err.to_string()),
            other => ApiError::Anki(other.to_string()),
        }
    }
}

impl From<ApkgError> for ApiError {
    fn from(err: ApkgError) -> Self {
        ApiError::Validation(err.to_string())
    }
}
