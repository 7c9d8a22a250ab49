use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use gatehouse_core::sender::Sender;

use super::history_key;
use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

/// One distinct recent message and how often the sender repeated it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub text: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateVerdict {
    /// Not similar to anything recent; appended to the history.
    Fresh,
    /// Matched a recent entry; occurrence count after the increment.
    Repeated { occurrences: u32 },
    /// Occurrence limit reached: the caller bans the sender.
    Exceeded,
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Compare the message against the history and mutate it accordingly.
/// Separated from store IO so the matching policy is testable on its own.
fn assess(history: &mut Vec<HistoryEntry>, text: &str, cfg: &GateConfig) -> DuplicateVerdict {
    let normalized = normalize(text);

    let matched = history.iter_mut().find(|entry| {
        normalized_levenshtein(&entry.text, &normalized) >= cfg.dup_similarity_threshold
    });

    if let Some(entry) = matched {
        entry.count += 1;
        if entry.count >= cfg.dup_occurrence_limit {
            return DuplicateVerdict::Exceeded;
        }
        return DuplicateVerdict::Repeated {
            occurrences: entry.count,
        };
    }

    history.push(HistoryEntry {
        text: normalized,
        count: 1,
    });
    if history.len() > cfg.dup_history_capacity {
        let excess = history.len() - cfg.dup_history_capacity;
        history.drain(..excess);
    }
    DuplicateVerdict::Fresh
}

/// Fuzzy duplicate-content check. Must run inside the per-sender `history`
/// lock. On `Exceeded` the history is not persisted; the ban clears it.
pub async fn check(
    kv: &KvStore,
    sender: &Sender,
    text: &str,
    cfg: &GateConfig,
) -> Result<DuplicateVerdict, KvError> {
    let key = history_key(sender);
    let mut history: Vec<HistoryEntry> = match kv.get_json(&key).await? {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => Vec::new(),
    };

    let verdict = assess(&mut history, text, cfg);
    if verdict != DuplicateVerdict::Exceeded {
        kv.put_json(&key, &serde_json::json!(history), cfg.dup_history_ttl)
            .await?;
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cfg() -> GateConfig {
        GateConfig {
            dup_history_capacity: 3,
            dup_similarity_threshold: 0.85,
            dup_occurrence_limit: 3,
            ..GateConfig::default()
        }
    }

    #[test]
    fn near_identical_text_counts_as_a_repeat() {
        let cfg = cfg();
        let mut history = Vec::new();
        assert_eq!(
            assess(&mut history, "What are your opening hours?", &cfg),
            DuplicateVerdict::Fresh
        );
        // Case and whitespace changes normalize away; one typo stays above 0.85.
        assert_eq!(
            assess(&mut history, "  WHAT ARE YOUR OPENING HOURS!  ", &cfg),
            DuplicateVerdict::Repeated { occurrences: 2 }
        );
    }

    #[test]
    fn third_occurrence_exceeds() {
        let cfg = cfg();
        let mut history = Vec::new();
        assess(&mut history, "buy now cheap watches", &cfg);
        assess(&mut history, "buy now cheap watches", &cfg);
        assert_eq!(
            assess(&mut history, "buy now cheap watches", &cfg),
            DuplicateVerdict::Exceeded
        );
    }

    #[test]
    fn unrelated_text_stays_fresh() {
        let cfg = cfg();
        let mut history = Vec::new();
        assess(&mut history, "do you ship to France?", &cfg);
        assert_eq!(
            assess(&mut history, "I want to book an appointment", &cfg),
            DuplicateVerdict::Fresh
        );
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let cfg = cfg();
        let mut history = Vec::new();
        for text in ["first message", "second thing", "third topic", "fourth idea"] {
            assess(&mut history, text, &cfg);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text, "second thing");
    }

    #[tokio::test]
    async fn exceeded_is_reached_across_requests() {
        let kv = KvStore::memory();
        let sender = Sender::Customer(Uuid::now_v7());
        let cfg = cfg();

        assert_eq!(
            check(&kv, &sender, "hello there", &cfg).await.unwrap(),
            DuplicateVerdict::Fresh
        );
        assert_eq!(
            check(&kv, &sender, "hello there", &cfg).await.unwrap(),
            DuplicateVerdict::Repeated { occurrences: 2 }
        );
        assert_eq!(
            check(&kv, &sender, "hello there", &cfg).await.unwrap(),
            DuplicateVerdict::Exceeded
        );
    }
}
