use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use gatehouse_core::error::ApiError;

use crate::abuse::{self, AbuseSeverity, AddressBlock};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::routes::ensure_operator;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/blocks", get(list_blocks).post(create_block))
        .route("/v1/admin/blocks/{id}", delete(deactivate_block))
        .route("/v1/admin/abuse-events", get(list_abuse_events))
        .route("/v1/admin/abuse-events/{id}/review", post(review_event))
        .route("/v1/admin/suspicious-addresses", get(suspicious_addresses))
        .route("/v1/admin/suspicious-senders", get(suspicious_senders))
        .route("/v1/admin/activity", get(activity_timeline))
}

// --- Address blocks ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBlockRequest {
    pub address: String,
    pub category: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Operator issuing the block; recorded for audit.
    pub created_by: Uuid,
    /// Omit for a permanent block.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Manually block a source address.
#[utoipa::path(
    post,
    path = "/v1/admin/blocks",
    request_body = CreateBlockRequest,
    responses(
        (status = 200, description = "Block created", body = AddressBlock),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 409, description = "An effective block already exists", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn create_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<CreateBlockRequest>,
) -> Result<Json<AddressBlock>, AppError> {
    ensure_operator(&state, &headers)?;
    let address = req.address.trim();
    if address.is_empty() {
        return Err(AppError::Validation {
            message: "address must not be empty".to_string(),
            field: Some("address".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if abuse::find_effective_block(&state.db, address).await?.is_some() {
        return Err(AppError::Conflict {
            message: format!("address {address} is already blocked"),
        });
    }

    let block = sqlx::query_as::<_, AddressBlock>(
        r#"
        INSERT INTO address_blocks (id, address, category, notes, created_by, expires_at, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE)
        ON CONFLICT (address) DO UPDATE
        SET category = EXCLUDED.category,
            notes = EXCLUDED.notes,
            created_by = EXCLUDED.created_by,
            created_at = NOW(),
            expires_at = EXCLUDED.expires_at,
            is_active = TRUE
        RETURNING id, address, category, notes, created_by, created_at, expires_at, is_active
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(address)
    .bind(req.category.trim())
    .bind(req.notes.as_deref())
    .bind(req.created_by)
    .bind(req.expires_at)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(address, operator = %req.created_by, "address blocked by operator");
    Ok(Json(block))
}

/// List blocks, effective ones first.
#[utoipa::path(
    get,
    path = "/v1/admin/blocks",
    responses(
        (status = 200, description = "Address blocks", body = [AddressBlock]),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_blocks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AddressBlock>>, AppError> {
    ensure_operator(&state, &headers)?;
    let blocks = sqlx::query_as::<_, AddressBlock>(
        r#"
        SELECT id, address, category, notes, created_by, created_at, expires_at, is_active
        FROM address_blocks
        ORDER BY is_active DESC, created_at DESC
        LIMIT 500
        "#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(blocks))
}

/// Lift a block. The row stays for audit; only `is_active` flips.
#[utoipa::path(
    delete,
    path = "/v1/admin/blocks/{id}",
    params(("id" = Uuid, Path, description = "Block id")),
    responses(
        (status = 200, description = "Block deactivated", body = AddressBlock),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn deactivate_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<AddressBlock>, AppError> {
    ensure_operator(&state, &headers)?;
    let block = sqlx::query_as::<_, AddressBlock>(
        r#"
        UPDATE address_blocks
        SET is_active = FALSE
        WHERE id = $1
        RETURNING id, address, category, notes, created_by, created_at, expires_at, is_active
        "#,
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        message: format!("block {id} not found"),
    })?;
    tracing::info!(address = %block.address, "address block lifted");
    Ok(Json(block))
}

// --- Abuse events ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct AbuseEventsQuery {
    #[serde(default)]
    pub severity: Option<AbuseSeverity>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub unreviewed_only: Option<bool>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow, ToSchema)]
pub struct AbuseEventView {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub address: String,
    pub category: String,
    pub severity: String,
    pub description: String,
    pub context: serde_json::Value,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}

/// List recorded abuse events, newest first, with optional filters.
#[utoipa::path(
    get,
    path = "/v1/admin/abuse-events",
    params(
        ("severity" = Option<String>, Query, description = "Filter by severity"),
        ("address" = Option<String>, Query, description = "Filter by source address"),
        ("unreviewed_only" = Option<bool>, Query, description = "Only events pending review"),
        ("limit" = Option<i64>, Query, description = "Max rows (default 100, cap 500)")
    ),
    responses(
        (status = 200, description = "Abuse events", body = [AbuseEventView]),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_abuse_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AbuseEventsQuery>,
) -> Result<Json<Vec<AbuseEventView>>, AppError> {
    ensure_operator(&state, &headers)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let unreviewed_only = query.unreviewed_only.unwrap_or(false);

    let events = sqlx::query_as::<_, AbuseEventView>(
        r#"
        SELECT id, customer_id, session_id, address, category, severity, description,
               context, reviewed, created_at
        FROM abuse_events
        WHERE ($1::text IS NULL OR severity = $1)
          AND ($2::text IS NULL OR address = $2)
          AND (NOT $3 OR reviewed = FALSE)
        ORDER BY created_at DESC
        LIMIT $4
        "#,
    )
    .bind(query.severity.map(|s| s.as_str()))
    .bind(query.address.as_deref())
    .bind(unreviewed_only)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(events))
}

/// Mark one abuse event as reviewed.
#[utoipa::path(
    post,
    path = "/v1/admin/abuse-events/{id}/review",
    params(("id" = Uuid, Path, description = "Event id")),
    responses(
        (status = 200, description = "Event marked reviewed"),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn review_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    ensure_operator(&state, &headers)?;
    if !abuse::mark_event_reviewed(&state.db, id).await? {
        return Err(AppError::NotFound {
            message: format!("abuse event {id} not found"),
        });
    }
    Ok(Json(json!({ "id": id, "reviewed": true })))
}

// --- Aggregates ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct SuspiciousAddressesQuery {
    /// Rolling window in hours (default 24).
    #[serde(default)]
    pub window_hours: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow, ToSchema)]
pub struct SuspiciousAddress {
    pub address: String,
    pub event_count: i64,
    pub critical_count: i64,
    pub high_count: i64,
    pub last_event_at: DateTime<Utc>,
}

/// Addresses ranked by abuse activity within a rolling window.
#[utoipa::path(
    get,
    path = "/v1/admin/suspicious-addresses",
    params(
        ("window_hours" = Option<i64>, Query, description = "Rolling window in hours (default 24)"),
        ("limit" = Option<i64>, Query, description = "Max rows (default 50)")
    ),
    responses(
        (status = 200, description = "Ranked addresses", body = [SuspiciousAddress]),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn suspicious_addresses(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SuspiciousAddressesQuery>,
) -> Result<Json<Vec<SuspiciousAddress>>, AppError> {
    ensure_operator(&state, &headers)?;
    let window_hours = query.window_hours.unwrap_or(24).clamp(1, 24 * 30);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let rows = sqlx::query_as::<_, SuspiciousAddress>(
        r#"
        SELECT address,
               COUNT(*) AS event_count,
               COUNT(*) FILTER (WHERE severity = 'critical') AS critical_count,
               COUNT(*) FILTER (WHERE severity = 'high') AS high_count,
               MAX(created_at) AS last_event_at
        FROM abuse_events
        WHERE created_at >= NOW() - $1 * INTERVAL '1 hour'
        GROUP BY address
        ORDER BY critical_count DESC, event_count DESC
        LIMIT $2
        "#,
    )
    .bind(window_hours)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize, sqlx::FromRow, ToSchema)]
pub struct SuspiciousSender {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub event_count: i64,
    pub critical_count: i64,
    pub high_count: i64,
    pub last_event_at: DateTime<Utc>,
}

/// Senders ranked by abuse activity within a rolling window.
#[utoipa::path(
    get,
    path = "/v1/admin/suspicious-senders",
    params(
        ("window_hours" = Option<i64>, Query, description = "Rolling window in hours (default 24)"),
        ("limit" = Option<i64>, Query, description = "Max rows (default 50)")
    ),
    responses(
        (status = 200, description = "Ranked senders", body = [SuspiciousSender]),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn suspicious_senders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SuspiciousAddressesQuery>,
) -> Result<Json<Vec<SuspiciousSender>>, AppError> {
    ensure_operator(&state, &headers)?;
    let window_hours = query.window_hours.unwrap_or(24).clamp(1, 24 * 30);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let rows = sqlx::query_as::<_, SuspiciousSender>(
        r#"
        SELECT customer_id, session_id,
               COUNT(*) AS event_count,
               COUNT(*) FILTER (WHERE severity = 'critical') AS critical_count,
               COUNT(*) FILTER (WHERE severity = 'high') AS high_count,
               MAX(created_at) AS last_event_at
        FROM abuse_events
        WHERE created_at >= NOW() - $1 * INTERVAL '1 hour'
        GROUP BY customer_id, session_id
        ORDER BY critical_count DESC, event_count DESC
        LIMIT $2
        "#,
    )
    .bind(window_hours)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActivityQuery {
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActivityEntry {
    /// "message" or "abuse_event"
    pub kind: String,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    message: String,
    response: String,
    blocked: bool,
    latency_ms: i32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct AbuseRow {
    category: String,
    severity: String,
    description: String,
    created_at: DateTime<Utc>,
}

/// One sender's merged timeline of messages and abuse events, newest first.
#[utoipa::path(
    get,
    path = "/v1/admin/activity",
    params(
        ("customer_id" = Option<Uuid>, Query, description = "Authenticated customer id"),
        ("session_id" = Option<String>, Query, description = "Anonymous session id"),
        ("limit" = Option<i64>, Query, description = "Max entries (default 100)")
    ),
    responses(
        (status = 200, description = "Activity timeline", body = [ActivityEntry]),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn activity_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEntry>>, AppError> {
    ensure_operator(&state, &headers)?;
    if query.customer_id.is_none() && query.session_id.is_none() {
        return Err(AppError::Validation {
            message: "customer_id or session_id is required".to_string(),
            field: None,
            received: None,
            docs_hint: Some("Pass exactly one sender identifier.".to_string()),
        });
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let conversations = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT message, response, blocked, latency_ms, created_at
        FROM conversation_log
        WHERE ($1::uuid IS NULL OR customer_id = $1)
          AND ($2::text IS NULL OR session_id = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(query.customer_id)
    .bind(query.session_id.as_deref())
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let abuse_events = sqlx::query_as::<_, AbuseRow>(
        r#"
        SELECT category, severity, description, created_at
        FROM abuse_events
        WHERE ($1::uuid IS NULL OR customer_id = $1)
          AND ($2::text IS NULL OR session_id = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(query.customer_id)
    .bind(query.session_id.as_deref())
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let mut entries: Vec<ActivityEntry> = conversations
        .into_iter()
        .map(|row| ActivityEntry {
            kind: "message".to_string(),
            at: row.created_at,
            detail: json!({
                "message": row.message,
                "response": row.response,
                "blocked": row.blocked,
                "latency_ms": row.latency_ms,
            }),
        })
        .chain(abuse_events.into_iter().map(|row| ActivityEntry {
            kind: "abuse_event".to_string(),
            at: row.created_at,
            detail: json!({
                "category": row.category,
                "severity": row.severity,
                "description": row.description,
            }),
        }))
        .collect();
    entries.sort_by(|a, b| b.at.cmp(&a.at));
    entries.truncate(limit as usize);
    Ok(Json(entries))
}
