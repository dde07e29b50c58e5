use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Top-level gateway error.
///
/// Detection logic (fingerprint lookups, tool-tag parsing) never produces one of
/// these for data-shape reasons; only client validation, backend connectivity and
/// storage failures do.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Client errors ────────────────────────────────────────────────────────
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("No conversation matches this message history; start a new conversation")]
    SessionNotFound { fingerprint: String },

    // ── Backend errors ───────────────────────────────────────────────────────
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Backend timed out: {message}")]
    BackendTimeout { message: String },

    #[error("Backend rejected the request with status {status}: {message}")]
    BackendRejected { status: u16, message: String },

    #[error("Backend sent an unexpected payload: {message}")]
    BackendProtocol { message: String },

    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        AppError::InvalidRequest { message: message.into() }
    }

    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::SessionNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::InvalidRequest { .. })
    }

    /// Transient backend failures that a bounded retry may resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::BackendUnavailable { .. } | AppError::BackendTimeout { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::BackendRejected { .. } | AppError::BackendProtocol { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::DatabaseQueryFailed { .. } | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest { .. } => "invalid_request",
            AppError::SessionNotFound { .. } => "session_not_found",
            AppError::BackendUnavailable { .. } => "backend_unavailable",
            AppError::BackendTimeout { .. } => "backend_timeout",
            AppError::BackendRejected { .. } => "backend_rejected",
            AppError::BackendProtocol { .. } => "backend_protocol_error",
            AppError::DatabaseQueryFailed { .. } => "storage_error",
            AppError::Unexpected(_) => "internal_error",
        }
    }

    fn error_type(&self) -> &'static str {
        if self.is_validation() {
            "invalid_request_error"
        } else if self.is_not_found() {
            "not_found_error"
        } else {
            "server_error"
        }
    }

    /// The `{"error": {...}}` envelope shared by HTTP responses and mid-stream
    /// error frames.
    pub fn envelope(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
