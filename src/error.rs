use crate::services::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Anyhow error: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

impl ReconcilerError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ReconcilerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ReconcilerError::NotFound(_) | ReconcilerError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ReconcilerError::Conflict(_) | ReconcilerError::Store(StoreError::Conflict(_)) => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            ReconcilerError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED")
            }
            ReconcilerError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            ReconcilerError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ReconcilerError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status, error_code) = self.status_and_code();

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
            request_id: request_id.clone(),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, error_code, request_id, "Request failed");
        } else {
            tracing::warn!(error = %self, error_code, request_id, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}
