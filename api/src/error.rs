use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatehouse_core::error::{self, ApiError};

/// Internal error type that converts to structured API responses.
///
/// The variants follow the admission taxonomy: validation (400),
/// admission-denied (429, auto-recoverable after the window expires),
/// ban/block (403, requires explicit unblock), contention (503, retryable),
/// upstream failure (503).
#[derive(Debug)]
pub enum AppError {
    /// Malformed or oversized input (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Sender is under an active suspension (403)
    SenderBanned { message: String },
    /// Source address is under an effective block (403)
    AddressBlocked,
    /// Admin credentials missing or wrong (401/403)
    Unauthorized,
    Forbidden { message: String },
    /// Quota, velocity or duplicate limit hit (429)
    AdmissionDenied {
        code: &'static str,
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Per-sender lock could not be acquired in time (503)
    Contention,
    /// Model gateway errored or timed out with no fallback available (503)
    Upstream { message: String },
    /// Entity lookup miss (404)
    NotFound { message: String },
    /// Illegal state transition or duplicate resource (409)
    Conflict { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                    retry_after_secs: None,
                },
            ),
            AppError::SenderBanned { message } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::SENDER_BANNED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "The suspension lifts automatically when it expires.".to_string(),
                    ),
                    retry_after_secs: None,
                },
            ),
            AppError::AddressBlocked => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::ADDRESS_BLOCKED.to_string(),
                    message: "Requests from this network address are not accepted.".to_string(),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: None,
                },
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message: "Missing or invalid credentials".to_string(),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: None,
                },
            ),
            AppError::Forbidden { message } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: None,
                },
            ),
            AppError::AdmissionDenied {
                code,
                message,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiError {
                    error: code.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs,
                },
            ),
            AppError::Contention => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError {
                    error: error::codes::SYSTEM_BUSY.to_string(),
                    message: "The system is busy handling your previous messages. Please retry."
                        .to_string(),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some("Retry with backoff.".to_string()),
                    retry_after_secs: Some(1),
                },
            ),
            AppError::Upstream { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError {
                    error: error::codes::UPSTREAM_UNAVAILABLE.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: Some(5),
                },
            ),
            AppError::NotFound { message } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: None,
                },
            ),
            AppError::Conflict { message } => (
                StatusCode::CONFLICT,
                ApiError {
                    error: error::codes::CONFLICT.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                    retry_after_secs: None,
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                        retry_after_secs: None,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                        retry_after_secs: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl AppError {
    /// Machine-readable code, mirroring the JSON body. Used where the error is
    /// stored rather than returned (queued jobs).
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => error::codes::VALIDATION_FAILED,
            AppError::SenderBanned { .. } => error::codes::SENDER_BANNED,
            AppError::AddressBlocked => error::codes::ADDRESS_BLOCKED,
            AppError::Unauthorized => error::codes::UNAUTHORIZED,
            AppError::Forbidden { .. } => error::codes::FORBIDDEN,
            AppError::AdmissionDenied { code, .. } => code,
            AppError::Contention => error::codes::SYSTEM_BUSY,
            AppError::Upstream { .. } => error::codes::UPSTREAM_UNAVAILABLE,
            AppError::NotFound { .. } => error::codes::NOT_FOUND,
            AppError::Conflict { .. } => error::codes::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => error::codes::INTERNAL_ERROR,
        }
    }

    /// Message safe to show the end user.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation { message, .. }
            | AppError::SenderBanned { message }
            | AppError::Forbidden { message }
            | AppError::AdmissionDenied { message, .. }
            | AppError::Upstream { message }
            | AppError::NotFound { message }
            | AppError::Conflict { message } => message.clone(),
            AppError::AddressBlocked => {
                "Requests from this network address are not accepted.".to_string()
            }
            AppError::Unauthorized => "Missing or invalid credentials".to_string(),
            AppError::Contention => {
                "The system is busy handling your previous messages. Please retry.".to_string()
            }
            AppError::Database(_) | AppError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<crate::kv::KvError> for AppError {
    fn from(err: crate::kv::KvError) -> Self {
        match err {
            crate::kv::KvError::Database(db) => AppError::Database(db),
        }
    }
}
