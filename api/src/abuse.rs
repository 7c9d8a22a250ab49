use chrono::{DateTime, Utc};
use gatehouse_core::sender::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::GateConfig;
use crate::notify::{self, notify_operators};

/// What kind of suspicious behavior an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AbuseCategory {
    Velocity,
    DailyLimit,
    DuplicateContent,
    JailbreakAttempt,
    MaliciousContent,
    OffTopicSpam,
    ExcessiveTokens,
}

impl AbuseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseCategory::Velocity => "velocity",
            AbuseCategory::DailyLimit => "daily-limit",
            AbuseCategory::DuplicateContent => "duplicate-content",
            AbuseCategory::JailbreakAttempt => "jailbreak-attempt",
            AbuseCategory::MaliciousContent => "malicious-content",
            AbuseCategory::OffTopicSpam => "off-topic-spam",
            AbuseCategory::ExcessiveTokens => "excessive-tokens",
        }
    }
}

/// Severity drives escalation: `Critical` events alert operators immediately
/// and feed the address auto-block counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AbuseSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AbuseSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseSeverity::Low => "low",
            AbuseSeverity::Medium => "medium",
            AbuseSeverity::High => "high",
            AbuseSeverity::Critical => "critical",
        }
    }
}

/// Durable block record for one source address.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AddressBlock {
    pub id: Uuid,
    pub address: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Null means the block was created by the escalator, not an operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// The live block for an address, if any: active and not expired.
pub async fn find_effective_block(
    pool: &PgPool,
    addr: &str,
) -> Result<Option<AddressBlock>, sqlx::Error> {
    sqlx::query_as::<_, AddressBlock>(
        r#"
        SELECT id, address, category, notes, created_by, created_at, expires_at, is_active
        FROM address_blocks
        WHERE address = $1
          AND is_active
          AND (expires_at IS NULL OR expires_at > NOW())
        "#,
    )
    .bind(addr)
    .fetch_optional(pool)
    .await
}

/// Record one durable abuse event. Critical severity synchronously alerts
/// operators and runs the auto-block escalator for the source address.
pub async fn record_abuse_event(
    pool: &PgPool,
    cfg: &GateConfig,
    sender: &Sender,
    addr: &str,
    category: AbuseCategory,
    severity: AbuseSeverity,
    description: &str,
    context: Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO abuse_events (customer_id, session_id, address, category, severity, description, context)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(sender.customer_id())
    .bind(sender.session_id())
    .bind(addr)
    .bind(category.as_str())
    .bind(severity.as_str())
    .bind(description)
    .bind(&context)
    .execute(pool)
    .await?;

    if severity == AbuseSeverity::Critical {
        notify_operators(
            pool.clone(),
            notify::kinds::CRITICAL_ABUSE,
            json!({
                "sender": sender.key(),
                "address": addr,
                "category": category.as_str(),
                "description": description,
            }),
        );
        escalate_address(pool, cfg, addr).await?;
    }
    Ok(())
}

/// Whether the rolling critical-event count warrants a new block.
fn should_auto_block(critical_count: i64, threshold: i64, enabled: bool) -> bool {
    enabled && critical_count >= threshold
}

/// Count critical events for the address within the rolling window; at the
/// threshold, create a permanent block unless an effective one already
/// exists. The conditional upsert makes concurrent critical events benign:
/// the losing writer affects zero rows and stays quiet.
pub async fn escalate_address(
    pool: &PgPool,
    cfg: &GateConfig,
    addr: &str,
) -> Result<bool, sqlx::Error> {
    let critical_count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM abuse_events
        WHERE address = $1
          AND severity = 'critical'
          AND created_at >= NOW() - $2::float8 * INTERVAL '1 second'
        "#,
    )
    .bind(addr)
    .bind(cfg.auto_block_window.as_secs_f64())
    .fetch_one(pool)
    .await?;

    if !should_auto_block(critical_count, cfg.auto_block_threshold, cfg.auto_block_enabled) {
        return Ok(false);
    }
    if find_effective_block(pool, addr).await?.is_some() {
        return Ok(false);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO address_blocks (id, address, category, notes, created_by, expires_at, is_active)
        VALUES ($1, $2, $3, $4, NULL, NULL, TRUE)
        ON CONFLICT (address) DO UPDATE
        SET category = EXCLUDED.category,
            notes = EXCLUDED.notes,
            created_by = NULL,
            created_at = NOW(),
            expires_at = NULL,
            is_active = TRUE
        WHERE address_blocks.is_active = FALSE
           OR (address_blocks.expires_at IS NOT NULL AND address_blocks.expires_at <= NOW())
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(addr)
    .bind("auto-critical-events")
    .bind(format!(
        "{critical_count} critical events within the rolling window"
    ))
    .execute(pool)
    .await?;

    let created = result.rows_affected() == 1;
    if created {
        tracing::warn!(address = addr, critical_count, "address auto-blocked");
        notify_operators(
            pool.clone(),
            notify::kinds::ADDRESS_AUTO_BLOCKED,
            json!({ "address": addr, "critical_count": critical_count }),
        );
    }
    Ok(created)
}

/// Admin review annotation — the only mutation an event ever receives.
pub async fn mark_event_reviewed(pool: &PgPool, event_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE abuse_events SET reviewed = TRUE WHERE id = $1")
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_puts_critical_on_top() {
        assert!(AbuseSeverity::Critical > AbuseSeverity::High);
        assert!(AbuseSeverity::High > AbuseSeverity::Medium);
        assert!(AbuseSeverity::Medium > AbuseSeverity::Low);
    }

    #[test]
    fn category_round_trips_through_serde() {
        let json = serde_json::to_string(&AbuseCategory::JailbreakAttempt).unwrap();
        assert_eq!(json, "\"jailbreak-attempt\"");
        let back: AbuseCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AbuseCategory::JailbreakAttempt);
    }

    #[test]
    fn auto_block_requires_threshold_and_enablement() {
        assert!(should_auto_block(3, 3, true));
        assert!(should_auto_block(5, 3, true));
        assert!(!should_auto_block(2, 3, true));
        assert!(!should_auto_block(10, 3, false));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn concurrent_critical_escalations_create_one_block(pool: PgPool) {
        let cfg = GateConfig {
            auto_block_threshold: 3,
            auto_block_enabled: true,
            ..GateConfig::default()
        };
        // Seed the critical events with the escalator disabled so the block
        // creation itself happens under the concurrent calls below.
        let seed_cfg = GateConfig {
            auto_block_enabled: false,
            ..cfg.clone()
        };
        let sender = Sender::anonymous("sess-crit").unwrap();
        let addr = "203.0.113.7";
        for n in 0..3 {
            record_abuse_event(
                &pool,
                &seed_cfg,
                &sender,
                addr,
                AbuseCategory::JailbreakAttempt,
                AbuseSeverity::Critical,
                "prompt-injection attempt",
                json!({ "n": n }),
            )
            .await
            .unwrap();
        }
        assert!(find_effective_block(&pool, addr).await.unwrap().is_none());

        let (a, b, c) = tokio::join!(
            escalate_address(&pool, &cfg, addr),
            escalate_address(&pool, &cfg, addr),
            escalate_address(&pool, &cfg, addr),
        );
        let created = [a.unwrap(), b.unwrap(), c.unwrap()]
            .into_iter()
            .filter(|won| *won)
            .count();
        assert_eq!(created, 1);

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM address_blocks WHERE address = $1 AND is_active",
        )
        .bind(addr)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(active, 1);
        // A later escalation sees the effective block and stays quiet.
        assert!(!escalate_address(&pool, &cfg, addr).await.unwrap());
    }
}
