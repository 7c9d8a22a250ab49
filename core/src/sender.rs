use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Logical identity used as the key for all per-actor admission state.
///
/// A sender is either a registered customer (stable account id) or an
/// anonymous visitor (per-browser session id issued by the fronting app).
/// It is a key, not a persisted entity — counters, locks, bans and
/// conversation memory all hang off `Sender::key()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Sender {
    Customer(Uuid),
    Anonymous(String),
}

#[derive(Debug, Error)]
pub enum SenderParseError {
    #[error("customer id is not a valid UUID: {0}")]
    InvalidCustomerId(String),
    #[error("anonymous session id is empty")]
    EmptySessionId,
}

impl Sender {
    pub fn customer(id: &str) -> Result<Self, SenderParseError> {
        Uuid::parse_str(id.trim())
            .map(Sender::Customer)
            .map_err(|_| SenderParseError::InvalidCustomerId(id.to_string()))
    }

    pub fn anonymous(session_id: &str) -> Result<Self, SenderParseError> {
        let trimmed = session_id.trim();
        if trimmed.is_empty() {
            return Err(SenderParseError::EmptySessionId);
        }
        Ok(Sender::Anonymous(trimmed.to_string()))
    }

    /// Stable store key: `customer:{uuid}` or `anon:{session_id}`.
    pub fn key(&self) -> String {
        match self {
            Sender::Customer(id) => format!("customer:{id}"),
            Sender::Anonymous(session) => format!("anon:{session}"),
        }
    }

    pub fn customer_id(&self) -> Option<Uuid> {
        match self {
            Sender::Customer(id) => Some(*id),
            Sender::Anonymous(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Sender::Customer(_) => None,
            Sender::Anonymous(session) => Some(session),
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_key_includes_uuid() {
        let id = Uuid::now_v7();
        let sender = Sender::Customer(id);
        assert_eq!(sender.key(), format!("customer:{id}"));
        assert_eq!(sender.customer_id(), Some(id));
        assert_eq!(sender.session_id(), None);
    }

    #[test]
    fn anonymous_key_uses_session_id() {
        let sender = Sender::anonymous("  sess-42  ").unwrap();
        assert_eq!(sender.key(), "anon:sess-42");
        assert_eq!(sender.session_id(), Some("sess-42"));
    }

    #[test]
    fn rejects_blank_session_id() {
        assert!(Sender::anonymous("   ").is_err());
    }

    #[test]
    fn rejects_malformed_customer_id() {
        assert!(Sender::customer("not-a-uuid").is_err());
    }
}
