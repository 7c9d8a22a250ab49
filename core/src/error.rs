use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response — designed for the fronting app and agents alike.
/// Every error carries enough information for the caller to understand what
/// was denied and whether retrying makes sense.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "rate_limited")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field or check caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value or state that was observed (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the caller should do next
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
    /// Seconds after which a retry may succeed (429/503 only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const SENDER_BANNED: &str = "sender_banned";
    pub const ADDRESS_BLOCKED: &str = "address_blocked";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const SYSTEM_BUSY: &str = "system_busy";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
