use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One user/assistant exchange, as stored in conversation memory and
/// snapshotted into handoff requests.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: String,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            at: Utc::now(),
        }
    }
}
