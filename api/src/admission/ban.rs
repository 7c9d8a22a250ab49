use chrono::Utc;
use gatehouse_core::sender::Sender;
use serde_json::json;

use super::{ban_key, history_key, strikes_key, velocity_key};
use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

/// Suspend the sender for the configured TTL and clear every ephemeral
/// counter for them in one store round-trip. A banned sender starts from a
/// clean slate once the suspension lapses.
pub async fn apply(
    kv: &KvStore,
    sender: &Sender,
    cfg: &GateConfig,
    reason: &str,
) -> Result<(), KvError> {
    kv.put_json(
        &ban_key(sender),
        &json!({ "reason": reason, "at": Utc::now() }),
        cfg.ban_ttl,
    )
    .await?;
    kv.delete_many(&[
        strikes_key(sender),
        history_key(sender),
        velocity_key(sender),
    ])
    .await?;
    tracing::info!(sender = %sender, reason, "sender banned");
    Ok(())
}

/// Flag read, performed before any other admission check.
pub async fn is_banned(kv: &KvStore, sender: &Sender) -> Result<bool, KvError> {
    Ok(kv.get_json(&ban_key(sender)).await?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{duplicate, strikes, velocity};
    use uuid::Uuid;

    #[tokio::test]
    async fn ban_sets_flag_and_clears_all_counters() {
        let kv = KvStore::memory();
        let sender = Sender::Customer(Uuid::now_v7());
        let cfg = GateConfig::default();
        let now = Utc::now();

        velocity::check(&kv, &sender, &cfg, now).await.unwrap();
        duplicate::check(&kv, &sender, "hello", &cfg).await.unwrap();
        strikes::add_strike(&kv, &sender, &cfg).await.unwrap();

        assert!(!is_banned(&kv, &sender).await.unwrap());
        apply(&kv, &sender, &cfg, "velocity").await.unwrap();
        assert!(is_banned(&kv, &sender).await.unwrap());

        assert!(kv.get_json(&velocity_key(&sender)).await.unwrap().is_none());
        assert!(kv.get_json(&history_key(&sender)).await.unwrap().is_none());
        assert!(kv.get_json(&strikes_key(&sender)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ban_is_scoped_to_one_sender() {
        let kv = KvStore::memory();
        let banned = Sender::anonymous("sess-bad").unwrap();
        let other = Sender::anonymous("sess-good").unwrap();
        let cfg = GateConfig::default();

        apply(&kv, &banned, &cfg, "duplicate-content").await.unwrap();
        assert!(is_banned(&kv, &banned).await.unwrap());
        assert!(!is_banned(&kv, &other).await.unwrap());
    }
}
