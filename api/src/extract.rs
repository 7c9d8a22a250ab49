//! Request extractors: sender identity from headers and a JSON body
//! extractor whose rejections use the structured error envelope.

use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::request::Parts,
};
use gatehouse_core::sender::Sender;

use crate::error::AppError;

pub const CUSTOMER_ID_HEADER: &str = "x-gatehouse-customer-id";
pub const SESSION_ID_HEADER: &str = "x-gatehouse-session-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Who is talking and from where. Built from identity headers plus the
/// request's source address. The customer-id header wins when both are sent.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub sender: Sender,
    pub addr: String,
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let sender = sender_from_headers(parts)?;
        let addr = source_address(parts);
        Ok(ClientIdentity { sender, addr })
    }
}

fn sender_from_headers(parts: &Parts) -> Result<Sender, AppError> {
    if let Some(raw) = header_str(parts, CUSTOMER_ID_HEADER) {
        return Sender::customer(raw).map_err(|_| AppError::Validation {
            message: "Customer id must be a UUID.".to_string(),
            field: Some(CUSTOMER_ID_HEADER.to_string()),
            received: Some(serde_json::json!(raw)),
            docs_hint: None,
        });
    }
    if let Some(raw) = header_str(parts, SESSION_ID_HEADER) {
        return Sender::anonymous(raw).map_err(|err| AppError::Validation {
            message: err.to_string(),
            field: Some(SESSION_ID_HEADER.to_string()),
            received: Some(serde_json::json!(raw)),
            docs_hint: None,
        });
    }
    Err(AppError::Validation {
        message: "A sender identity header is required.".to_string(),
        field: None,
        received: None,
        docs_hint: Some(format!(
            "Send {CUSTOMER_ID_HEADER} (UUID) or {SESSION_ID_HEADER}."
        )),
    })
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Source address: first hop of X-Forwarded-For when present (the service
/// sits behind a proxy in production), otherwise the socket peer address.
fn source_address(parts: &Parts) -> String {
    if let Some(forwarded) = header_str(parts, FORWARDED_FOR_HEADER)
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// JSON extractor that converts deserialization errors to structured
/// `AppError` responses instead of axum's plain-text 422.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();

    // Extract a useful field hint from common serde error patterns:
    // "missing field `message`" → field = "message"
    let field_hint = extract_field_from_serde_message(&body_text);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_hint.unwrap_or("body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /openapi.json).".to_string(),
        ),
    }
}

/// Try to extract a field name from serde's error messages.
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    for pattern in ["missing field `", "unknown field `"] {
        if let Some(start) = msg.find(pattern) {
            let after = &msg[start + pattern.len()..];
            if let Some(end) = after.find('`') {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use uuid::Uuid;

    fn parts_with(headers: &[(&str, &str)]) -> Parts {
        let mut builder = HttpRequest::builder().uri("/v1/chat/messages");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn customer_header_wins_over_session() {
        let id = Uuid::now_v7();
        let parts = parts_with(&[
            (CUSTOMER_ID_HEADER, &id.to_string()),
            (SESSION_ID_HEADER, "sess-1"),
        ]);
        let sender = sender_from_headers(&parts).unwrap();
        assert_eq!(sender, Sender::Customer(id));
    }

    #[test]
    fn session_header_builds_anonymous_sender() {
        let parts = parts_with(&[(SESSION_ID_HEADER, "sess-42")]);
        let sender = sender_from_headers(&parts).unwrap();
        assert_eq!(sender.key(), "anon:sess-42");
    }

    #[test]
    fn missing_identity_is_a_validation_error() {
        let parts = parts_with(&[]);
        assert!(matches!(
            sender_from_headers(&parts),
            Err(AppError::Validation { .. })
        ));
    }

    #[test]
    fn malformed_customer_uuid_is_rejected() {
        let parts = parts_with(&[(CUSTOMER_ID_HEADER, "not-a-uuid")]);
        assert!(matches!(
            sender_from_headers(&parts),
            Err(AppError::Validation { .. })
        ));
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let parts = parts_with(&[
            (SESSION_ID_HEADER, "s"),
            (FORWARDED_FOR_HEADER, "203.0.113.9, 10.0.0.1"),
        ]);
        assert_eq!(source_address(&parts), "203.0.113.9");
    }

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize: missing field `message` at line 1 column 72";
        assert_eq!(
            extract_field_from_serde_message(msg),
            Some("message".to_string())
        );
    }

    #[test]
    fn no_field_hint_for_type_errors() {
        let msg = "invalid type: string, expected u64";
        assert_eq!(extract_field_from_serde_message(msg), None);
    }
}
