use std::time::Instant;

use chrono::Utc;
use gatehouse_core::model::{ModelAction, ModelOutcome};
use gatehouse_core::sender::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::abuse::{self, AbuseCategory, AbuseSeverity};
use crate::admission::{ban, duplicate, quota, strikes, velocity};
use crate::config::GateConfig;
use crate::content::{self, ContentVerdict};
use crate::error::AppError;
use crate::handoff;
use crate::lock::{self, resources};
use crate::memory;
use crate::state::AppState;

const SUSPENSION_MESSAGE: &str =
    "This conversation has been suspended. If you believe this is a mistake, please contact us.";
const INTENT_OFF_TOPIC: &str = "off_topic";

/// Successful pipeline output, also the payload cached for replay protection.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PipelineReply {
    pub reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<Uuid>,
}

/// How the model outcome is acted on after admission passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// BLOCK action or toxicity at the ban floor: hard-ban, reply 403.
    Suspend,
    /// Escalate to a human operator, then reply normally.
    Handoff,
    /// Off-topic content: strike counter decides between warning and ban.
    OffTopicStrike,
    Reply,
    /// Schema violation from the gateway: reply, but suppress side effects.
    ReplyNoSideEffects,
}

fn classify_dispatch(outcome: &ModelOutcome, cfg: &GateConfig) -> Dispatch {
    let action = outcome.effective_action();
    if action == ModelAction::Block || outcome.analysis.toxicity_level >= cfg.toxicity_ban_floor {
        return Dispatch::Suspend;
    }
    match action {
        ModelAction::Handoff => Dispatch::Handoff,
        ModelAction::Unrecognized => Dispatch::ReplyNoSideEffects,
        ModelAction::Reply | ModelAction::Block => {
            if outcome.analysis.intent == INTENT_OFF_TOPIC {
                Dispatch::OffTopicStrike
            } else {
                Dispatch::Reply
            }
        }
    }
}

fn dedup_key(sender: &Sender, text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("dedup:{}:{}", sender.key(), hex::encode(digest))
}

/// Record an abuse event, logging instead of failing: a broken audit trail
/// must not change the user-facing outcome that was already decided.
async fn record_abuse(
    state: &AppState,
    sender: &Sender,
    addr: &str,
    category: AbuseCategory,
    severity: AbuseSeverity,
    description: &str,
    context: Value,
) {
    if let Err(err) = abuse::record_abuse_event(
        &state.db,
        &state.cfg,
        sender,
        addr,
        category,
        severity,
        description,
        context,
    )
    .await
    {
        tracing::warn!(
            error = %err,
            sender = %sender,
            category = category.as_str(),
            "failed to record abuse event"
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn log_conversation(
    state: &AppState,
    sender: &Sender,
    addr: &str,
    message: &str,
    response: &str,
    blocked: bool,
    latency_ms: i32,
    outcome: Option<&ModelOutcome>,
) {
    let (prompt_tokens, completion_tokens) = outcome
        .map(|o| (o.tokens.prompt_tokens, o.tokens.completion_tokens))
        .unwrap_or((0, 0));
    if let Err(err) = sqlx::query(
        r#"
        INSERT INTO conversation_log
            (id, customer_id, session_id, address, message, response, blocked,
             latency_ms, prompt_tokens, completion_tokens)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(sender.customer_id())
    .bind(sender.session_id())
    .bind(addr)
    .bind(message)
    .bind(response)
    .bind(blocked)
    .bind(latency_ms)
    .bind(prompt_tokens)
    .bind(completion_tokens)
    .execute(&state.db)
    .await
    {
        tracing::warn!(error = %err, sender = %sender, "failed to persist conversation log entry");
    }
}

/// The admission pipeline, one inbound message end to end. Invoked
/// identically from the inline HTTP handler and the queue worker; only the
/// transport wrapping differs.
///
/// Checks run in strict order and short-circuit with a distinct outcome:
/// address block, ban, length, injection screening, daily quota, replay
/// dedup, velocity, duplicate content, then the model call and its dispatch.
pub async fn process_message(
    state: &AppState,
    sender: &Sender,
    addr: &str,
    text: &str,
) -> Result<PipelineReply, AppError> {
    let cfg = &state.cfg;
    let started = Instant::now();

    // 1. Address-level block.
    if abuse::find_effective_block(&state.db, addr).await?.is_some() {
        return Err(AppError::AddressBlocked);
    }

    // 2. Sender ban flag.
    if ban::is_banned(&state.kv, sender).await? {
        return Err(AppError::SenderBanned {
            message: SUSPENSION_MESSAGE.to_string(),
        });
    }

    // 3–4. Length and injection screening.
    match content::screen(text, cfg.max_message_chars) {
        ContentVerdict::Clean => {}
        ContentVerdict::TooLong { chars, limit } => {
            return Err(AppError::Validation {
                message: format!("Message is too long ({chars} characters, limit {limit})."),
                field: Some("message".to_string()),
                received: Some(json!(chars)),
                docs_hint: Some("Split the message into shorter parts.".to_string()),
            });
        }
        ContentVerdict::Injection { matched } => {
            record_abuse(
                state,
                sender,
                addr,
                AbuseCategory::JailbreakAttempt,
                AbuseSeverity::Critical,
                "prompt-injection attempt",
                json!({ "matched": matched, "message": text }),
            )
            .await;
            return Err(AppError::Validation {
                message: "Your message could not be processed.".to_string(),
                field: Some("message".to_string()),
                received: None,
                docs_hint: None,
            });
        }
    }

    // 5. Daily quota, sender then address.
    let now = Utc::now();
    match quota::check_and_count(&state.kv, sender, addr, cfg, now).await? {
        quota::QuotaVerdict::Allowed => {}
        verdict => {
            let scope = if verdict == quota::QuotaVerdict::SenderExceeded {
                "sender"
            } else {
                "address"
            };
            record_abuse(
                state,
                sender,
                addr,
                AbuseCategory::DailyLimit,
                AbuseSeverity::High,
                "daily quota exceeded",
                json!({ "scope": scope }),
            )
            .await;
            let retry = quota::until_local_midnight(now, cfg.business_timezone).as_secs();
            return Err(AppError::AdmissionDenied {
                code: gatehouse_core::error::codes::QUOTA_EXCEEDED,
                message: "Daily message limit reached. Please come back tomorrow.".to_string(),
                retry_after_secs: Some(retry),
            });
        }
    }

    // 6. Replay dedup: an identical request inside the window returns the
    // cached reply with no further side effects.
    let dedup_key = dedup_key(sender, text);
    if let Some(cached) = state.kv.get_json(&dedup_key).await?
        && let Ok(reply) = serde_json::from_value::<PipelineReply>(cached)
    {
        tracing::debug!(sender = %sender, "served deduplicated reply");
        return Ok(reply);
    }

    // 7. Velocity, inside the per-sender velocity lock.
    let velocity_lock =
        lock::acquire_with_retry(&state.kv, sender, resources::VELOCITY, cfg).await?;
    let velocity_verdict = velocity::check(&state.kv, sender, cfg, now).await;
    velocity_lock.release().await;
    if velocity_verdict? == velocity::VelocityVerdict::Exceeded {
        ban::apply(&state.kv, sender, cfg, "velocity").await?;
        record_abuse(
            state,
            sender,
            addr,
            AbuseCategory::Velocity,
            AbuseSeverity::Medium,
            "message velocity ceiling exceeded",
            json!({ "window_secs": cfg.velocity_window.as_secs() }),
        )
        .await;
        return Err(AppError::AdmissionDenied {
            code: gatehouse_core::error::codes::RATE_LIMITED,
            message: "You're sending messages too quickly. This conversation is paused."
                .to_string(),
            retry_after_secs: Some(cfg.ban_ttl.as_secs()),
        });
    }

    // 8. Fuzzy duplicate content, inside the history lock.
    let history_lock = lock::acquire_with_retry(&state.kv, sender, resources::HISTORY, cfg).await?;
    let dup_verdict = duplicate::check(&state.kv, sender, text, cfg).await;
    history_lock.release().await;
    if dup_verdict? == duplicate::DuplicateVerdict::Exceeded {
        ban::apply(&state.kv, sender, cfg, "duplicate-content").await?;
        record_abuse(
            state,
            sender,
            addr,
            AbuseCategory::DuplicateContent,
            AbuseSeverity::High,
            "repeated near-identical messages",
            json!({ "occurrence_limit": cfg.dup_occurrence_limit }),
        )
        .await;
        return Err(AppError::AdmissionDenied {
            code: gatehouse_core::error::codes::RATE_LIMITED,
            message: "Please don't repeat the same message. This conversation is paused."
                .to_string(),
            retry_after_secs: Some(cfg.ban_ttl.as_secs()),
        });
    }

    // 9. Model invocation with conversation context.
    let turns = memory::read(&state.kv, sender).await?;
    let outcome = match state.model.invoke(sender, text, &turns).await {
        Ok(outcome) => outcome,
        Err(err) => {
            // Degrade to the fixed fallback reply instead of failing the
            // message. An empty fallback disables degradation and surfaces
            // the outage to the caller.
            if cfg.fallback_reply.is_empty() {
                return Err(AppError::Upstream {
                    message: "The assistant is temporarily unavailable. Please retry shortly."
                        .to_string(),
                });
            }
            tracing::warn!(error = %err, sender = %sender, "model invocation failed; serving fallback");
            let latency_ms = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
            let reply = PipelineReply {
                reply: cfg.fallback_reply.clone(),
                handoff_id: None,
            };
            log_conversation(state, sender, addr, text, &reply.reply, false, latency_ms, None)
                .await;
            return Ok(reply);
        }
    };

    // 10. Action dispatch.
    let dispatch = classify_dispatch(&outcome, cfg);
    if dispatch == Dispatch::ReplyNoSideEffects {
        tracing::error!(
            sender = %sender,
            "model returned an unrecognized action; replying without side effects"
        );
    }

    let mut reply_text = outcome.reply.clone();
    let mut handoff_id = None;
    match dispatch {
        Dispatch::Suspend => {
            ban::apply(&state.kv, sender, cfg, "model-block").await?;
            record_abuse(
                state,
                sender,
                addr,
                AbuseCategory::MaliciousContent,
                AbuseSeverity::High,
                "model blocked the exchange",
                json!({
                    "toxicity_level": outcome.analysis.toxicity_level,
                    "source": outcome.source.clone(),
                }),
            )
            .await;
            let latency_ms = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
            log_conversation(
                state,
                sender,
                addr,
                text,
                SUSPENSION_MESSAGE,
                true,
                latency_ms,
                Some(&outcome),
            )
            .await;
            return Err(AppError::SenderBanned {
                message: SUSPENSION_MESSAGE.to_string(),
            });
        }
        Dispatch::Handoff => {
            let mut snapshot = turns.clone();
            snapshot.push(gatehouse_core::conversation::ConversationTurn::new(
                text,
                outcome.reply.clone(),
            ));
            let request = handoff::create_handoff(
                &state.db,
                cfg,
                sender,
                outcome.analysis.customer_score,
                &outcome.analysis.intent,
                &snapshot,
                json!({ "missing_info": outcome.analysis.missing_info.clone() }),
            )
            .await?;
            handoff_id = Some(request.id);
        }
        Dispatch::OffTopicStrike => {
            let strikes_lock =
                lock::acquire_with_retry(&state.kv, sender, resources::STRIKES, cfg).await?;
            let strike_verdict = strikes::add_strike(&state.kv, sender, cfg).await;
            strikes_lock.release().await;
            match strike_verdict? {
                strikes::StrikeVerdict::Exceeded => {
                    ban::apply(&state.kv, sender, cfg, "off-topic-strikes").await?;
                    record_abuse(
                        state,
                        sender,
                        addr,
                        AbuseCategory::OffTopicSpam,
                        AbuseSeverity::Medium,
                        "off-topic strike limit reached",
                        json!({ "strike_limit": cfg.strike_limit }),
                    )
                    .await;
                    let latency_ms = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
                    log_conversation(
                        state,
                        sender,
                        addr,
                        text,
                        SUSPENSION_MESSAGE,
                        true,
                        latency_ms,
                        Some(&outcome),
                    )
                    .await;
                    return Err(AppError::SenderBanned {
                        message: SUSPENSION_MESSAGE.to_string(),
                    });
                }
                strikes::StrikeVerdict::Warned { message, .. } => {
                    reply_text = message;
                }
            }
        }
        Dispatch::Reply | Dispatch::ReplyNoSideEffects => {}
    }

    // 11. Durable log, conversation memory, replay cache.
    let latency_ms = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
    log_conversation(
        state,
        sender,
        addr,
        text,
        &reply_text,
        false,
        latency_ms,
        Some(&outcome),
    )
    .await;
    if dispatch != Dispatch::ReplyNoSideEffects {
        memory::append(&state.kv, sender, cfg, text, &reply_text).await?;
    }

    let reply = PipelineReply {
        reply: reply_text,
        handoff_id,
    };
    state
        .kv
        .put_json(&dedup_key, &json!(reply), cfg.dedup_window)
        .await?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::model::{ModelAnalysis, TokenUsage};

    fn outcome(action: ModelAction, toxicity: i32, intent: &str) -> ModelOutcome {
        ModelOutcome {
            reply: "answer".to_string(),
            analysis: ModelAnalysis {
                action,
                toxicity_level: toxicity,
                customer_score: 50,
                intent: intent.to_string(),
                missing_info: None,
            },
            tokens: TokenUsage::default(),
            source: Some("model".to_string()),
        }
    }

    #[test]
    fn block_action_suspends() {
        let cfg = GateConfig::default();
        let out = outcome(ModelAction::Block, 0, "general");
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::Suspend);
    }

    #[test]
    fn toxicity_at_the_floor_suspends_even_on_reply() {
        let cfg = GateConfig::default();
        let out = outcome(ModelAction::Reply, cfg.toxicity_ban_floor, "general");
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::Suspend);
    }

    #[test]
    fn guardrail_source_suspends_regardless_of_action() {
        let cfg = GateConfig::default();
        let mut out = outcome(ModelAction::Reply, 0, "general");
        out.source = Some(gatehouse_core::model::SECURITY_GUARDRAIL_SOURCE.to_string());
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::Suspend);
    }

    #[test]
    fn handoff_action_escalates() {
        let cfg = GateConfig::default();
        let out = outcome(ModelAction::Handoff, 0, "purchase_intent");
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::Handoff);
    }

    #[test]
    fn off_topic_intent_routes_to_strikes() {
        let cfg = GateConfig::default();
        let out = outcome(ModelAction::Reply, 0, INTENT_OFF_TOPIC);
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::OffTopicStrike);
    }

    #[test]
    fn unrecognized_action_replies_without_side_effects() {
        let cfg = GateConfig::default();
        let out = outcome(ModelAction::Unrecognized, 0, INTENT_OFF_TOPIC);
        assert_eq!(classify_dispatch(&out, &cfg), Dispatch::ReplyNoSideEffects);
    }

    #[test]
    fn dedup_key_is_stable_and_text_sensitive() {
        let sender = Sender::anonymous("sess-1").unwrap();
        assert_eq!(dedup_key(&sender, "hello"), dedup_key(&sender, "hello"));
        assert_ne!(dedup_key(&sender, "hello"), dedup_key(&sender, "hello!"));
        let other = Sender::anonymous("sess-2").unwrap();
        assert_ne!(dedup_key(&sender, "hello"), dedup_key(&other, "hello"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn replayed_message_serves_the_cached_reply_and_logs_once(pool: sqlx::PgPool) {
        let (queue_tx, _queue_rx) = tokio::sync::mpsc::channel(8);
        let state = AppState {
            db: pool.clone(),
            kv: crate::kv::KvStore::memory(),
            cfg: std::sync::Arc::new(GateConfig::default()),
            model: crate::model::ModelBackend::Static(outcome(ModelAction::Reply, 0, "general")),
            queue_tx,
        };
        let sender = Sender::anonymous("sess-replay").unwrap();

        let first = process_message(&state, &sender, "10.0.0.1", "What are your opening hours?")
            .await
            .unwrap();
        // Identical text inside the window: same reply, no second exchange.
        let second = process_message(&state, &sender, "10.0.0.1", "What are your opening hours?")
            .await
            .unwrap();
        assert_eq!(first.reply, second.reply);

        let logged: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversation_log WHERE session_id = $1")
                .bind("sess-replay")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(logged, 1);

        let turns = memory::read(&state.kv, &sender).await.unwrap();
        assert_eq!(turns.len(), 1);
    }
}
