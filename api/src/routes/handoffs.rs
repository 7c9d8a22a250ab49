use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use gatehouse_core::error::ApiError;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::handoff::{self, HandoffMessage, HandoffRequest, HandoffStatus, MessageSenderKind};
use crate::routes::ensure_operator;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/handoffs", get(list_handoffs))
        .route("/v1/handoffs/{id}", get(get_handoff))
        .route("/v1/handoffs/{id}/assign", post(assign))
        .route("/v1/handoffs/{id}/messages", post(post_message))
        .route("/v1/handoffs/{id}/resolve", post(resolve))
        .route("/v1/handoffs/{id}/cancel", post(cancel))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListHandoffsQuery {
    /// Restrict to one lifecycle status (e.g. "pending").
    #[serde(default)]
    pub status: Option<HandoffStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HandoffView {
    #[serde(flatten)]
    pub request: HandoffRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_time_secs: Option<i64>,
}

impl From<HandoffRequest> for HandoffView {
    fn from(request: HandoffRequest) -> Self {
        let response_time_secs = request.response_time_secs();
        let resolution_time_secs = request.resolution_time_secs();
        HandoffView {
            request,
            response_time_secs,
            resolution_time_secs,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HandoffDetail {
    #[serde(flatten)]
    pub view: HandoffView,
    pub messages: Vec<HandoffMessage>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignRequest {
    pub operator_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PostMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

/// List handoff requests, optionally filtered by status, newest first.
#[utoipa::path(
    get,
    path = "/v1/handoffs",
    params(
        ("status" = Option<String>, Query, description = "Filter by lifecycle status"),
        ("limit" = Option<i64>, Query, description = "Max rows (default 50, cap 200)")
    ),
    responses(
        (status = 200, description = "Handoff requests", body = [HandoffView]),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn list_handoffs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListHandoffsQuery>,
) -> Result<Json<Vec<HandoffView>>, AppError> {
    ensure_operator(&state, &headers)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let rows = match query.status {
        Some(status) => {
            sqlx::query_as::<_, HandoffRequest>(
                r#"
                SELECT id, customer_id, session_id, client_score, escalation_reason, status,
                       assigned_to, assigned_at, resolved_at, conversation_context,
                       client_interests, internal_notes, created_at
                FROM handoff_requests
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&state.db)
            .await?
        }
        None => {
            sqlx::query_as::<_, HandoffRequest>(
                r#"
                SELECT id, customer_id, session_id, client_score, escalation_reason, status,
                       assigned_to, assigned_at, resolved_at, conversation_context,
                       client_interests, internal_notes, created_at
                FROM handoff_requests
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&state.db)
            .await?
        }
    };

    Ok(Json(rows.into_iter().map(HandoffView::from).collect()))
}

/// Fetch one handoff with its message thread.
#[utoipa::path(
    get,
    path = "/v1/handoffs/{id}",
    params(("id" = Uuid, Path, description = "Handoff id")),
    responses(
        (status = 200, description = "Handoff with messages", body = HandoffDetail),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn get_handoff(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<HandoffDetail>, AppError> {
    ensure_operator(&state, &headers)?;
    let request = handoff::fetch_handoff(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            message: format!("handoff {id} not found"),
        })?;
    let messages = handoff::list_messages(&state.db, id).await?;
    Ok(Json(HandoffDetail {
        view: HandoffView::from(request),
        messages,
    }))
}

/// Claim a pending handoff for an operator.
#[utoipa::path(
    post,
    path = "/v1/handoffs/{id}/assign",
    params(("id" = Uuid, Path, description = "Handoff id")),
    request_body = AssignRequest,
    responses(
        (status = 200, description = "Handoff assigned", body = HandoffView),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError),
        (status = 409, description = "Not claimable in its current status", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn assign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<AssignRequest>,
) -> Result<Json<HandoffView>, AppError> {
    ensure_operator(&state, &headers)?;
    match handoff::assign_handoff(&state.db, id, req.operator_id).await? {
        Some(request) => Ok(Json(HandoffView::from(request))),
        None => Err(status_conflict(&state, id, HandoffStatus::Assigned).await?),
    }
}

/// Append an operator message to the handoff thread.
#[utoipa::path(
    post,
    path = "/v1/handoffs/{id}/messages",
    params(("id" = Uuid, Path, description = "Handoff id")),
    request_body = PostMessageRequest,
    responses(
        (status = 200, description = "Message appended", body = HandoffMessage),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError),
        (status = 409, description = "Handoff is not active", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<PostMessageRequest>,
) -> Result<Json<HandoffMessage>, AppError> {
    ensure_operator(&state, &headers)?;
    let body = req.body.trim();
    if body.is_empty() {
        return Err(AppError::Validation {
            message: "body must not be empty".to_string(),
            field: Some("body".to_string()),
            received: None,
            docs_hint: None,
        });
    }

    let request = handoff::fetch_handoff(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            message: format!("handoff {id} not found"),
        })?;
    let status = request.status_enum();
    if !matches!(status, HandoffStatus::Assigned | HandoffStatus::InProgress) {
        return Err(AppError::Conflict {
            message: format!("handoff is {}; messages need an active handoff", status.as_str()),
        });
    }

    let message = handoff::add_message(&state.db, id, MessageSenderKind::Operator, body).await?;
    Ok(Json(message))
}

/// Resolve an active handoff, optionally attaching internal notes.
#[utoipa::path(
    post,
    path = "/v1/handoffs/{id}/resolve",
    params(("id" = Uuid, Path, description = "Handoff id")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Handoff resolved", body = HandoffView),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError),
        (status = 409, description = "Not resolvable in its current status", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<ResolveRequest>,
) -> Result<Json<HandoffView>, AppError> {
    ensure_operator(&state, &headers)?;
    match handoff::resolve_handoff(&state.db, id, req.notes.as_deref()).await? {
        Some(request) => Ok(Json(HandoffView::from(request))),
        None => Err(status_conflict(&state, id, HandoffStatus::Resolved).await?),
    }
}

/// Cancel a handoff that has not reached a terminal state.
#[utoipa::path(
    post,
    path = "/v1/handoffs/{id}/cancel",
    params(("id" = Uuid, Path, description = "Handoff id")),
    responses(
        (status = 200, description = "Handoff cancelled", body = HandoffView),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Not found", body = ApiError),
        (status = 409, description = "Already terminal", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "handoffs"
)]
pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<HandoffView>, AppError> {
    ensure_operator(&state, &headers)?;
    match handoff::cancel_handoff(&state.db, id).await? {
        Some(request) => Ok(Json(HandoffView::from(request))),
        None => Err(status_conflict(&state, id, HandoffStatus::Cancelled).await?),
    }
}

/// A guarded UPDATE matched no row: either the handoff does not exist (404)
/// or its current status forbids the transition (409 naming both states).
async fn status_conflict(
    state: &AppState,
    id: Uuid,
    target: HandoffStatus,
) -> Result<AppError, AppError> {
    match handoff::fetch_handoff(&state.db, id).await? {
        Some(request) => {
            let current = request.status_enum();
            Ok(AppError::Conflict {
                message: format!(
                    "handoff is {}; cannot move to {}",
                    current.as_str(),
                    target.as_str()
                ),
            })
        }
        None => Ok(AppError::NotFound {
            message: format!("handoff {id} not found"),
        }),
    }
}
