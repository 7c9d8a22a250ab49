use chrono::{DateTime, Utc};
use gatehouse_core::conversation::ConversationTurn;
use gatehouse_core::sender::Sender;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::GateConfig;
use crate::notify::{self, notify_operators};

/// Apology appended as an operator message when a request expires unclaimed.
const EXPIRY_APOLOGY: &str =
    "We're sorry — all of our team members are busy right now. We've noted your \
     request and someone will reach out to you as soon as possible.";

/// Handoff lifecycle. `Resolved`, `Cancelled` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Assigned,
    InProgress,
    Resolved,
    Cancelled,
    Expired,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Assigned => "assigned",
            HandoffStatus::InProgress => "in_progress",
            HandoffStatus::Resolved => "resolved",
            HandoffStatus::Cancelled => "cancelled",
            HandoffStatus::Expired => "expired",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value {
            "assigned" => HandoffStatus::Assigned,
            "in_progress" => HandoffStatus::InProgress,
            "resolved" => HandoffStatus::Resolved,
            "cancelled" => HandoffStatus::Cancelled,
            "expired" => HandoffStatus::Expired,
            _ => HandoffStatus::Pending,
        }
    }
}

/// The legal transition relation. The watcher's `Expired` edge only leaves
/// `Pending`; operators can never expire a request by hand.
pub fn can_transition(from: HandoffStatus, to: HandoffStatus) -> bool {
    use HandoffStatus::*;
    matches!(
        (from, to),
        (Pending, Assigned)
            | (Assigned, InProgress)
            | (Assigned, Resolved)
            | (InProgress, Resolved)
            | (Pending, Cancelled)
            | (Assigned, Cancelled)
            | (InProgress, Cancelled)
            | (Pending, Expired)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageSenderKind {
    Operator,
    Client,
}

impl MessageSenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSenderKind::Operator => "operator",
            MessageSenderKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct HandoffRequest {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub client_score: i32,
    pub escalation_reason: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub conversation_context: serde_json::Value,
    pub client_interests: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HandoffRequest {
    pub fn status_enum(&self) -> HandoffStatus {
        HandoffStatus::from_db_value(&self.status)
    }

    /// Seconds from creation to assignment. Derived, never stored.
    pub fn response_time_secs(&self) -> Option<i64> {
        self.assigned_at
            .map(|at| (at - self.created_at).num_seconds())
    }

    /// Seconds from creation to operator resolution. Derived, never stored.
    /// Cancelled and expired requests never set `resolved_at`, so this stays
    /// `None` for them.
    pub fn resolution_time_secs(&self) -> Option<i64> {
        self.resolved_at
            .map(|at| (at - self.created_at).num_seconds())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct HandoffMessage {
    pub id: Uuid,
    pub handoff_id: Uuid,
    pub sender_kind: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

const HANDOFF_COLUMNS: &str = "id, customer_id, session_id, client_score, escalation_reason, \
     status, assigned_to, assigned_at, resolved_at, conversation_context, client_interests, \
     internal_notes, created_at";

/// Create a pending handoff carrying a snapshot of the recent conversation
/// and the model's scoring, notify operators, and schedule the timeout
/// watcher.
pub async fn create_handoff(
    pool: &PgPool,
    cfg: &GateConfig,
    sender: &Sender,
    client_score: i32,
    escalation_reason: &str,
    turns: &[ConversationTurn],
    client_interests: serde_json::Value,
) -> Result<HandoffRequest, sqlx::Error> {
    let request = sqlx::query_as::<_, HandoffRequest>(&format!(
        r#"
        INSERT INTO handoff_requests
            (id, customer_id, session_id, client_score, escalation_reason, status,
             conversation_context, client_interests)
        VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
        RETURNING {HANDOFF_COLUMNS}
        "#
    ))
    .bind(Uuid::now_v7())
    .bind(sender.customer_id())
    .bind(sender.session_id())
    .bind(client_score)
    .bind(escalation_reason)
    .bind(json!(turns))
    .bind(&client_interests)
    .fetch_one(pool)
    .await?;

    notify_operators(
        pool.clone(),
        notify::kinds::HANDOFF_REQUESTED,
        json!({
            "handoff_id": request.id,
            "sender": sender.key(),
            "client_score": client_score,
            "reason": escalation_reason,
        }),
    );
    spawn_timeout_watcher(pool.clone(), cfg.handoff_timeout, request.id);
    Ok(request)
}

pub async fn fetch_handoff(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<HandoffRequest>, sqlx::Error> {
    sqlx::query_as::<_, HandoffRequest>(&format!(
        "SELECT {HANDOFF_COLUMNS} FROM handoff_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Operator claims a pending request. The `status = 'pending'` guard makes
/// concurrent claims race safely: exactly one UPDATE wins.
pub async fn assign_handoff(
    pool: &PgPool,
    id: Uuid,
    operator_id: Uuid,
) -> Result<Option<HandoffRequest>, sqlx::Error> {
    sqlx::query_as::<_, HandoffRequest>(&format!(
        r#"
        UPDATE handoff_requests
        SET status = 'assigned', assigned_to = $2, assigned_at = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING {HANDOFF_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(operator_id)
    .fetch_optional(pool)
    .await
}

/// Append a message to the handoff thread. The first operator message moves
/// an `assigned` request to `in_progress`.
pub async fn add_message(
    pool: &PgPool,
    handoff_id: Uuid,
    sender_kind: MessageSenderKind,
    body: &str,
) -> Result<HandoffMessage, sqlx::Error> {
    let message = sqlx::query_as::<_, HandoffMessage>(
        r#"
        INSERT INTO handoff_messages (id, handoff_id, sender_kind, body)
        VALUES ($1, $2, $3, $4)
        RETURNING id, handoff_id, sender_kind, body, created_at, read_at
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(handoff_id)
    .bind(sender_kind.as_str())
    .bind(body)
    .fetch_one(pool)
    .await?;

    if sender_kind == MessageSenderKind::Operator {
        sqlx::query(
            "UPDATE handoff_requests SET status = 'in_progress' WHERE id = $1 AND status = 'assigned'",
        )
        .bind(handoff_id)
        .execute(pool)
        .await?;
    }
    Ok(message)
}

pub async fn list_messages(
    pool: &PgPool,
    handoff_id: Uuid,
) -> Result<Vec<HandoffMessage>, sqlx::Error> {
    sqlx::query_as::<_, HandoffMessage>(
        r#"
        SELECT id, handoff_id, sender_kind, body, created_at, read_at
        FROM handoff_messages
        WHERE handoff_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(handoff_id)
    .fetch_all(pool)
    .await
}

pub async fn resolve_handoff(
    pool: &PgPool,
    id: Uuid,
    internal_notes: Option<&str>,
) -> Result<Option<HandoffRequest>, sqlx::Error> {
    sqlx::query_as::<_, HandoffRequest>(&format!(
        r#"
        UPDATE handoff_requests
        SET status = 'resolved', resolved_at = NOW(),
            internal_notes = COALESCE($2, internal_notes)
        WHERE id = $1 AND status IN ('assigned', 'in_progress')
        RETURNING {HANDOFF_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(internal_notes)
    .fetch_optional(pool)
    .await
}

/// Cancel an open request. `resolved_at` stays null: only operator
/// resolution counts as a resolution time.
pub async fn cancel_handoff(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<HandoffRequest>, sqlx::Error> {
    sqlx::query_as::<_, HandoffRequest>(&format!(
        r#"
        UPDATE handoff_requests
        SET status = 'cancelled'
        WHERE id = $1 AND status IN ('pending', 'assigned', 'in_progress')
        RETURNING {HANDOFF_COLUMNS}
        "#
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Deferred expiry job. Fires once after the timeout and checks the state it
/// finds then: only a request still `pending` expires — last state wins, the
/// watcher never overrides a transition that already happened.
pub fn spawn_timeout_watcher(pool: PgPool, timeout: std::time::Duration, handoff_id: Uuid) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Err(err) = expire_if_pending(&pool, handoff_id).await {
            tracing::error!(error = %err, handoff_id = %handoff_id, "handoff expiry watcher failed");
        }
    });
}

/// Mark the request expired if (and only if) it is still pending. Appends the
/// apology exactly once, alongside the winning UPDATE.
pub async fn expire_if_pending(pool: &PgPool, handoff_id: Uuid) -> Result<bool, sqlx::Error> {
    let expired = sqlx::query_as::<_, HandoffRequest>(&format!(
        r#"
        UPDATE handoff_requests
        SET status = 'expired'
        WHERE id = $1 AND status = 'pending'
        RETURNING {HANDOFF_COLUMNS}
        "#
    ))
    .bind(handoff_id)
    .fetch_optional(pool)
    .await?;

    let Some(request) = expired else {
        match fetch_handoff(pool, handoff_id).await? {
            Some(request) => {
                tracing::debug!(
                    handoff_id = %handoff_id,
                    status = %request.status,
                    "handoff left pending before the watcher fired; expiry is a no-op"
                );
            }
            None => {
                // The request may have been legitimately deleted.
                tracing::error!(handoff_id = %handoff_id, "handoff not found at expiry time");
            }
        }
        return Ok(false);
    };

    add_message(pool, request.id, MessageSenderKind::Operator, EXPIRY_APOLOGY).await?;
    notify_operators(
        pool.clone(),
        notify::kinds::HANDOFF_EXPIRED,
        json!({
            "handoff_id": request.id,
            "client_score": request.client_score,
            "reason": request.escalation_reason,
        }),
    );
    tracing::warn!(handoff_id = %handoff_id, "handoff expired unclaimed");
    Ok(true)
}
