use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use gatehouse_core::error::ApiError;

use crate::error::AppError;
use crate::extract::{AppJson, ClientIdentity};
use crate::pipeline::{self, PipelineReply};
use crate::queue;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/messages", post(submit_message))
        .route("/v1/chat/jobs/{job_id}", get(get_job))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Process in the request, reply in the response body.
    #[default]
    Inline,
    /// Accept now, process on the worker pool, poll for the result.
    Queued,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatMessageRequest {
    pub message: String,
    #[serde(default)]
    pub mode: SubmitMode,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueuedMessageResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    response: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn validated_message(raw: &str) -> Result<String, AppError> {
    let message = raw.trim();
    if message.is_empty() {
        return Err(AppError::Validation {
            message: "message must not be empty".to_string(),
            field: Some("message".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(message.to_string())
}

/// Submit a chat message through the admission pipeline.
///
/// Inline mode runs the full pipeline and answers in-band; queued mode
/// answers 202 with a job id to poll. Denials surface as structured errors
/// either way.
#[utoipa::path(
    post,
    path = "/v1/chat/messages",
    request_body = ChatMessageRequest,
    responses(
        (status = 200, description = "Message processed", body = PipelineReply),
        (status = 202, description = "Message queued", body = QueuedMessageResponse),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 403, description = "Sender banned or address blocked", body = ApiError),
        (status = 429, description = "Admission denied", body = ApiError),
        (status = 503, description = "Busy or upstream unavailable", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn submit_message(
    State(state): State<AppState>,
    identity: ClientIdentity,
    AppJson(req): AppJson<ChatMessageRequest>,
) -> Result<Response, AppError> {
    let message = validated_message(&req.message)?;
    let ClientIdentity { sender, addr } = identity;

    match req.mode {
        SubmitMode::Inline => {
            let reply = pipeline::process_message(&state, &sender, &addr, &message).await?;
            Ok(Json(reply).into_response())
        }
        SubmitMode::Queued => {
            let job_id = queue::enqueue(&state, sender, addr, message).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(QueuedMessageResponse {
                    job_id,
                    status: queue::JOB_QUEUED.to_string(),
                }),
            )
                .into_response())
        }
    }
}

/// Poll a queued message's status and result.
#[utoipa::path(
    get,
    path = "/v1/chat/jobs/{job_id}",
    params(
        ("job_id" = Uuid, Path, description = "Job id returned by a queued submission")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, status, response, error, created_at, updated_at
        FROM message_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(&state.db)
    .await?;

    let Some(row) = row else {
        return Err(AppError::NotFound {
            message: format!("job {job_id} not found"),
        });
    };

    let result = row
        .response
        .and_then(|value| serde_json::from_value::<PipelineReply>(value).ok());
    Ok(Json(JobStatusResponse {
        job_id: row.id,
        status: row.status,
        result,
        error: row.error,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_fails_validation() {
        assert!(matches!(
            validated_message("   "),
            Err(AppError::Validation { .. })
        ));
    }

    #[test]
    fn message_is_trimmed() {
        assert_eq!(validated_message("  hi  ").unwrap(), "hi");
    }

    #[test]
    fn mode_defaults_to_inline() {
        let req: ChatMessageRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(req.mode, SubmitMode::Inline);
    }

    #[test]
    fn queued_mode_parses() {
        let req: ChatMessageRequest =
            serde_json::from_str(r#"{"message": "hi", "mode": "queued"}"#).unwrap();
        assert_eq!(req.mode, SubmitMode::Queued);
    }
}
