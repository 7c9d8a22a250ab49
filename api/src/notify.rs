use serde_json::Value;
use sqlx::PgPool;

/// Operator notification kinds.
pub mod kinds {
    pub const HANDOFF_REQUESTED: &str = "handoff_requested";
    pub const HANDOFF_EXPIRED: &str = "handoff_expired";
    pub const CRITICAL_ABUSE: &str = "critical_abuse";
    pub const ADDRESS_AUTO_BLOCKED: &str = "address_auto_blocked";
}

/// Fire-and-forget operator notification. The delivery workers that fan these
/// rows out to email/SMS/WhatsApp live outside this service; here the row is
/// the trigger contract. A failed insert is logged and never surfaces to the
/// pipeline — alerting must not break message handling.
pub fn notify_operators(pool: PgPool, kind: &str, context: Value) {
    let kind = kind.to_string();
    tokio::spawn(async move {
        if let Err(err) = sqlx::query(
            "INSERT INTO operator_notifications (kind, context) VALUES ($1, $2)",
        )
        .bind(&kind)
        .bind(&context)
        .execute(&pool)
        .await
        {
            tracing::warn!(error = %err, kind, "failed to persist operator notification");
        }
    });
}
