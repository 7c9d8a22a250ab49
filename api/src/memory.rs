use gatehouse_core::conversation::ConversationTurn;
use gatehouse_core::sender::Sender;

use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

fn memory_key(sender: &Sender) -> String {
    format!("memory:{}", sender.key())
}

/// Ordered recent turns for the sender, oldest first.
pub async fn read(kv: &KvStore, sender: &Sender) -> Result<Vec<ConversationTurn>, KvError> {
    Ok(match kv.get_json(&memory_key(sender)).await? {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => Vec::new(),
    })
}

/// Append one exchange, evicting the oldest turns past capacity. Every append
/// refreshes the retention TTL.
pub async fn append(
    kv: &KvStore,
    sender: &Sender,
    cfg: &GateConfig,
    user_text: &str,
    assistant_text: &str,
) -> Result<(), KvError> {
    let mut turns = read(kv, sender).await?;
    turns.push(ConversationTurn::new(user_text, assistant_text));
    if turns.len() > cfg.memory_turns {
        let excess = turns.len() - cfg.memory_turns;
        turns.drain(..excess);
    }
    kv.put_json(&memory_key(sender), &serde_json::json!(turns), cfg.memory_ttl)
        .await
}

pub async fn clear(kv: &KvStore, sender: &Sender) -> Result<(), KvError> {
    kv.delete(&memory_key(sender)).await
}
