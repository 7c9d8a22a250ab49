use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

mod abuse;
mod admission;
mod config;
mod content;
mod error;
mod extract;
mod handoff;
mod kv;
mod lock;
mod memory;
mod middleware;
mod model;
mod notify;
mod pipeline;
mod queue;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gatehouse API",
        version = "0.1.0",
        description = "Admission control and abuse mitigation for AI chat: per-sender \
                       rate windows, duplicate detection, daily quotas, handoff to \
                       human operators."
    ),
    paths(
        routes::health::health_check,
        routes::chat::submit_message,
        routes::chat::get_job,
        routes::handoffs::list_handoffs,
        routes::handoffs::get_handoff,
        routes::handoffs::assign,
        routes::handoffs::post_message,
        routes::handoffs::resolve,
        routes::handoffs::cancel,
        routes::admin::create_block,
        routes::admin::list_blocks,
        routes::admin::deactivate_block,
        routes::admin::list_abuse_events,
        routes::admin::review_event,
        routes::admin::suspicious_addresses,
        routes::admin::suspicious_senders,
        routes::admin::activity_timeline,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::chat::ChatMessageRequest,
        routes::chat::SubmitMode,
        routes::chat::QueuedMessageResponse,
        routes::chat::JobStatusResponse,
        routes::handoffs::ListHandoffsQuery,
        routes::handoffs::HandoffView,
        routes::handoffs::HandoffDetail,
        routes::handoffs::AssignRequest,
        routes::handoffs::PostMessageRequest,
        routes::handoffs::ResolveRequest,
        routes::admin::CreateBlockRequest,
        routes::admin::AbuseEventView,
        routes::admin::SuspiciousAddress,
        routes::admin::SuspiciousSender,
        routes::admin::ActivityEntry,
        pipeline::PipelineReply,
        handoff::HandoffRequest,
        handoff::HandoffMessage,
        handoff::HandoffStatus,
        abuse::AddressBlock,
        abuse::AbuseCategory,
        abuse::AbuseSeverity,
        gatehouse_core::error::ApiError,
        gatehouse_core::model::ModelAction,
        gatehouse_core::conversation::ConversationTurn,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

/// A restart drops in-process expiry timers; re-arm one watcher per handoff
/// still pending. Requests already past their deadline expire immediately.
async fn rearm_handoff_watchers(pool: &sqlx::PgPool, cfg: &config::GateConfig) {
    let rows: Vec<(Uuid, DateTime<Utc>)> = match sqlx::query_as(
        "SELECT id, created_at FROM handoff_requests WHERE status = 'pending'",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(error = %err, "failed to load pending handoffs at boot");
            return;
        }
    };

    let now = Utc::now();
    for (id, created_at) in rows {
        let deadline = created_at + chrono::Duration::from_std(cfg.handoff_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        tracing::info!(handoff_id = %id, remaining_secs = remaining.as_secs(), "re-arming handoff watcher");
        handoff::spawn_timeout_watcher(pool.clone(), remaining, id);
    }
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let cfg = Arc::new(config::GateConfig::from_env());
    let model = model::ModelBackend::from_env();
    let kv = kv::KvStore::postgres(pool.clone());

    let (queue_tx, queue_rx) = mpsc::channel(queue::QUEUE_CAPACITY);

    let app_state = state::AppState {
        db: pool.clone(),
        kv,
        cfg: cfg.clone(),
        model,
        queue_tx,
    };

    let worker_count: usize = std::env::var("GATEHOUSE_QUEUE_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    queue::start_workers(app_state.clone(), queue_rx, worker_count);

    rearm_handoff_watchers(&pool, &cfg).await;

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-surface transport rate limits
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::chat::router().layer(middleware::rate_limit::chat_layer()))
        .merge(routes::handoffs::router().layer(middleware::rate_limit::admin_layer()))
        .merge(routes::admin::router().layer(middleware::rate_limit::admin_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gatehouse API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
