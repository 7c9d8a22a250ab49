use gatehouse_core::sender::Sender;

use super::strikes_key;
use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrikeVerdict {
    /// Below the limit; carries the warning to show the sender.
    Warned { strikes: u32, message: String },
    /// Strike limit reached: the caller bans the sender.
    Exceeded,
}

fn warning_text(strikes: u32, limit: u32) -> String {
    let remaining = limit.saturating_sub(strikes);
    if remaining <= 1 {
        "This assistant only answers questions about our products and services. \
         One more off-topic message will suspend this conversation."
            .to_string()
    } else {
        "I can only help with questions about our products and services. \
         Please keep the conversation on topic."
            .to_string()
    }
}

/// Register one off-topic strike. Must run inside the per-sender `strikes`
/// lock. Each strike refreshes the counter's expiry, so persistent drifting
/// accumulates while an occasional stray question is forgotten.
pub async fn add_strike(
    kv: &KvStore,
    sender: &Sender,
    cfg: &GateConfig,
) -> Result<StrikeVerdict, KvError> {
    let key = strikes_key(sender);
    let current: u32 = match kv.get_json(&key).await? {
        Some(value) => serde_json::from_value(value).unwrap_or(0),
        None => 0,
    };

    let strikes = current + 1;
    if strikes >= cfg.strike_limit {
        return Ok(StrikeVerdict::Exceeded);
    }

    kv.put_json(&key, &serde_json::json!(strikes), cfg.strike_ttl)
        .await?;
    Ok(StrikeVerdict::Warned {
        strikes,
        message: warning_text(strikes, cfg.strike_limit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn third_strike_exceeds_with_default_limit() {
        let kv = KvStore::memory();
        let sender = Sender::Customer(Uuid::now_v7());
        let cfg = GateConfig::default();

        let first = add_strike(&kv, &sender, &cfg).await.unwrap();
        assert!(matches!(first, StrikeVerdict::Warned { strikes: 1, .. }));

        let second = add_strike(&kv, &sender, &cfg).await.unwrap();
        assert!(matches!(second, StrikeVerdict::Warned { strikes: 2, .. }));

        let third = add_strike(&kv, &sender, &cfg).await.unwrap();
        assert_eq!(third, StrikeVerdict::Exceeded);
    }

    #[tokio::test]
    async fn final_warning_is_more_severe() {
        let kv = KvStore::memory();
        let sender = Sender::anonymous("sess-9").unwrap();
        let cfg = GateConfig::default();

        let StrikeVerdict::Warned { message: first, .. } =
            add_strike(&kv, &sender, &cfg).await.unwrap()
        else {
            panic!("first strike should warn");
        };
        let StrikeVerdict::Warned { message: last, .. } =
            add_strike(&kv, &sender, &cfg).await.unwrap()
        else {
            panic!("second strike should warn");
        };
        assert_ne!(first, last);
        assert!(last.contains("suspend"));
    }
}
