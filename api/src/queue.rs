use std::sync::Arc;

use gatehouse_core::sender::Sender;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::AppError;
use crate::pipeline;
use crate::state::AppState;

/// Bound on queued-but-unprocessed messages. Beyond this the service sheds
/// load with a 503 instead of growing an unbounded backlog.
pub const QUEUE_CAPACITY: usize = 256;

pub const JOB_QUEUED: &str = "queued";
pub const JOB_PROCESSING: &str = "processing";
pub const JOB_DONE: &str = "done";
pub const JOB_FAILED: &str = "failed";

#[derive(Debug)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub sender: Sender,
    pub addr: String,
    pub text: String,
}

/// Persist a job row, then hand the job to the worker pool. The row exists
/// before the send so a poll for the id never races the enqueue.
pub async fn enqueue(
    state: &AppState,
    sender: Sender,
    addr: String,
    text: String,
) -> Result<Uuid, AppError> {
    let job_id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO message_jobs (id, customer_id, session_id, status)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(job_id)
    .bind(sender.customer_id())
    .bind(sender.session_id())
    .bind(JOB_QUEUED)
    .execute(&state.db)
    .await?;

    let job = QueuedJob {
        job_id,
        sender,
        addr,
        text,
    };
    if let Err(err) = state.queue_tx.try_send(job) {
        tracing::warn!(job_id = %job_id, error = %err, "queue full; shedding message");
        mark_failed(
            &state.db,
            job_id,
            gatehouse_core::error::codes::SYSTEM_BUSY,
            "The queue is full. Please retry shortly.",
        )
        .await;
        return Err(AppError::Contention);
    }
    Ok(job_id)
}

/// Spawn `count` workers draining a shared receiver. Workers run for the
/// lifetime of the process; a failed job marks its row and moves on.
pub fn start_workers(state: AppState, rx: mpsc::Receiver<QueuedJob>, count: usize) {
    let rx = Arc::new(Mutex::new(rx));
    for worker_id in 0..count {
        let state = state.clone();
        let rx = Arc::clone(&rx);
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(job) = job else {
                    tracing::info!(worker_id, "queue channel closed; worker exiting");
                    break;
                };
                run_job(&state, job, worker_id).await;
            }
        });
    }
}

async fn run_job(state: &AppState, job: QueuedJob, worker_id: usize) {
    tracing::debug!(worker_id, job_id = %job.job_id, sender = %job.sender, "processing queued message");
    if let Err(err) = set_status(&state.db, job.job_id, JOB_PROCESSING).await {
        tracing::warn!(job_id = %job.job_id, error = %err, "failed to mark job processing");
    }

    match pipeline::process_message(state, &job.sender, &job.addr, &job.text).await {
        Ok(reply) => {
            let result = sqlx::query(
                r#"
                UPDATE message_jobs
                SET status = $2, response = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.job_id)
            .bind(JOB_DONE)
            .bind(json!(reply))
            .execute(&state.db)
            .await;
            if let Err(err) = result {
                tracing::warn!(job_id = %job.job_id, error = %err, "failed to store job result");
            }
        }
        Err(err) => {
            tracing::info!(
                job_id = %job.job_id,
                sender = %job.sender,
                code = err.code(),
                "queued message denied"
            );
            mark_failed(&state.db, job.job_id, err.code(), &err.public_message()).await;
        }
    }
}

async fn set_status(pool: &PgPool, job_id: Uuid, status: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE message_jobs SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(job_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

async fn mark_failed(pool: &PgPool, job_id: Uuid, code: &str, message: &str) {
    let result = sqlx::query(
        r#"
        UPDATE message_jobs
        SET status = $2, error = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_FAILED)
    .bind(json!({ "error": code, "message": message }))
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(job_id = %job_id, error = %err, "failed to mark job failed");
    }
}
