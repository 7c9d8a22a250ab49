use chrono::{DateTime, Duration as ChronoDuration, Utc};

use gatehouse_core::sender::Sender;

use super::velocity_key;
use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

/// Outcome of the sliding-window velocity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityVerdict {
    Allowed { used: usize },
    /// The window is full: the caller bans the sender and reports blocked.
    Exceeded,
}

/// Drop timestamps that fell out of the window.
fn prune_window(
    mut stamps: Vec<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: std::time::Duration,
) -> Vec<DateTime<Utc>> {
    let cutoff = now - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
    stamps.retain(|stamp| *stamp > cutoff);
    stamps
}

/// Check and update the sender's message velocity. Must run inside the
/// per-sender `velocity` lock — two concurrent requests from the same sender
/// would otherwise both read the pre-update window and lose a count.
///
/// On `Exceeded` the window is left as-is; the ban that follows clears it.
pub async fn check(
    kv: &KvStore,
    sender: &Sender,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> Result<VelocityVerdict, KvError> {
    let key = velocity_key(sender);
    let stamps: Vec<DateTime<Utc>> = match kv.get_json(&key).await? {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => Vec::new(),
    };

    let mut stamps = prune_window(stamps, now, cfg.velocity_window);
    if stamps.len() >= cfg.velocity_ceiling {
        return Ok(VelocityVerdict::Exceeded);
    }

    stamps.push(now);
    let used = stamps.len();
    kv.put_json(&key, &serde_json::json!(stamps), cfg.velocity_window)
        .await?;
    Ok(VelocityVerdict::Allowed { used })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn cfg() -> GateConfig {
        GateConfig {
            velocity_ceiling: 3,
            velocity_window: Duration::from_secs(60),
            ..GateConfig::default()
        }
    }

    #[test]
    fn prune_drops_only_stale_stamps() {
        let now = Utc::now();
        let stamps = vec![
            now - ChronoDuration::seconds(120),
            now - ChronoDuration::seconds(59),
            now - ChronoDuration::seconds(5),
        ];
        let pruned = prune_window(stamps, now, Duration::from_secs(60));
        assert_eq!(pruned.len(), 2);
    }

    #[tokio::test]
    async fn allows_until_ceiling_then_exceeds() {
        let kv = KvStore::memory();
        let sender = Sender::Customer(Uuid::now_v7());
        let cfg = cfg();
        let now = Utc::now();

        for used in 1..=3usize {
            let verdict = check(&kv, &sender, &cfg, now).await.unwrap();
            assert_eq!(verdict, VelocityVerdict::Allowed { used });
        }
        let verdict = check(&kv, &sender, &cfg, now).await.unwrap();
        assert_eq!(verdict, VelocityVerdict::Exceeded);
    }

    #[tokio::test]
    async fn stale_stamps_free_the_window() {
        let kv = KvStore::memory();
        let sender = Sender::Customer(Uuid::now_v7());
        let cfg = cfg();
        let earlier = Utc::now();

        for _ in 0..3 {
            check(&kv, &sender, &cfg, earlier).await.unwrap();
        }
        // Same window is full...
        assert_eq!(
            check(&kv, &sender, &cfg, earlier).await.unwrap(),
            VelocityVerdict::Exceeded
        );
        // ...but two minutes later all three stamps have aged out.
        let later = earlier + ChronoDuration::seconds(120);
        assert_eq!(
            check(&kv, &sender, &cfg, later).await.unwrap(),
            VelocityVerdict::Allowed { used: 1 }
        );
    }

    #[tokio::test]
    async fn senders_do_not_share_windows() {
        let kv = KvStore::memory();
        let cfg = cfg();
        let now = Utc::now();
        let first = Sender::Customer(Uuid::now_v7());
        let second = Sender::anonymous("sess-1").unwrap();

        for _ in 0..3 {
            check(&kv, &first, &cfg, now).await.unwrap();
        }
        assert_eq!(
            check(&kv, &second, &cfg, now).await.unwrap(),
            VelocityVerdict::Allowed { used: 1 }
        );
    }
}
