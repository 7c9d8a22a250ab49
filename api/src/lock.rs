use std::time::Duration;

use gatehouse_core::sender::Sender;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::GateConfig;
use crate::error::AppError;
use crate::kv::{KvError, KvStore};

/// Named per-sender resources. Independent names use independent locks, so a
/// velocity update never serializes against a history update.
pub mod resources {
    pub const VELOCITY: &str = "velocity";
    pub const HISTORY: &str = "history";
    pub const STRIKES: &str = "strikes";
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MIN_MS: u64 = 50;
const RETRY_BACKOFF_MAX_MS: u64 = 150;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock for resource '{resource}' still contended after timeout")]
    Contended { resource: String },
    #[error(transparent)]
    Store(#[from] KvError),
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contended { .. } => AppError::Contention,
            LockError::Store(store) => AppError::Internal(store.to_string()),
        }
    }
}

/// Mutual exclusion for one (sender, resource) pair.
///
/// The claim carries a unique ownership token and expires after the lock TTL
/// even if never released, so a crashed holder cannot deadlock the sender.
/// `release` only deletes the claim while the stored token still matches —
/// a holder that outlived its TTL cannot free a lock someone else has since
/// re-acquired.
pub struct SenderLock {
    kv: KvStore,
    key: String,
    token: String,
}

impl SenderLock {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(self) {
        match self.kv.release_claim(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                // TTL expired and another holder took over; nothing to free.
                tracing::warn!(key = %self.key, "lock token no longer current at release");
            }
            Err(err) => {
                tracing::warn!(error = %err, key = %self.key, "lock release failed");
            }
        }
    }
}

/// Acquire the named lock, polling up to `acquire_timeout`.
pub async fn acquire(
    kv: &KvStore,
    sender: &Sender,
    resource: &str,
    ttl: Duration,
    acquire_timeout: Duration,
) -> Result<SenderLock, LockError> {
    let key = format!("lock:{}:{resource}", sender.key());
    let token = uuid::Uuid::now_v7().to_string();
    let deadline = Instant::now() + acquire_timeout;

    loop {
        if kv.try_claim(&key, &token, ttl).await? {
            return Ok(SenderLock {
                kv: kv.clone(),
                key,
                token,
            });
        }
        if Instant::now() + LOCK_POLL_INTERVAL > deadline {
            return Err(LockError::Contended {
                resource: resource.to_string(),
            });
        }
        tokio::time::sleep(LOCK_POLL_INTERVAL).await;
    }
}

/// Acquire with the pipeline's bounded retry policy: the configured number of
/// extra attempts with short jittered backoff, then surface the contention —
/// the caller answers "system busy", never a silent pass.
pub async fn acquire_with_retry(
    kv: &KvStore,
    sender: &Sender,
    resource: &str,
    cfg: &GateConfig,
) -> Result<SenderLock, LockError> {
    let attempts = cfg.lock_retry_attempts + 1;
    for attempt in 0..attempts {
        match acquire(kv, sender, resource, cfg.lock_ttl, cfg.lock_acquire_timeout).await {
            Ok(lock) => return Ok(lock),
            Err(LockError::Contended { .. }) if attempt + 1 < attempts => {
                let backoff =
                    rand::thread_rng().gen_range(RETRY_BACKOFF_MIN_MS..=RETRY_BACKOFF_MAX_MS);
                tracing::debug!(
                    sender = %sender,
                    resource,
                    attempt,
                    "lock contended; backing off before retry"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(LockError::Contended {
        resource: resource.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sender() -> Sender {
        Sender::Customer(Uuid::now_v7())
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let kv = KvStore::memory();
        let sender = sender();
        let held = acquire(
            &kv,
            &sender,
            resources::VELOCITY,
            Duration::from_secs(3),
            Duration::from_millis(150),
        )
        .await
        .unwrap();

        let contended = acquire(
            &kv,
            &sender,
            resources::VELOCITY,
            Duration::from_secs(3),
            Duration::from_millis(150),
        )
        .await;
        assert!(matches!(contended, Err(LockError::Contended { .. })));
        held.release().await;
    }

    #[tokio::test]
    async fn different_resources_do_not_contend() {
        let kv = KvStore::memory();
        let sender = sender();
        let velocity = acquire(
            &kv,
            &sender,
            resources::VELOCITY,
            Duration::from_secs(3),
            Duration::from_millis(150),
        )
        .await
        .unwrap();
        let history = acquire(
            &kv,
            &sender,
            resources::HISTORY,
            Duration::from_secs(3),
            Duration::from_millis(150),
        )
        .await
        .unwrap();
        velocity.release().await;
        history.release().await;
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_a_reacquired_lock() {
        let kv = KvStore::memory();
        let sender = sender();

        // First holder's TTL lapses without a release.
        let stale = acquire(
            &kv,
            &sender,
            resources::HISTORY,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A new holder takes over after expiry.
        let fresh = acquire(
            &kv,
            &sender,
            resources::HISTORY,
            Duration::from_secs(3),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_ne!(stale.token(), fresh.token());

        // The stale release is a no-op; the fresh claim must survive it.
        stale.release().await;
        let still_held = acquire(
            &kv,
            &sender,
            resources::HISTORY,
            Duration::from_secs(3),
            Duration::from_millis(150),
        )
        .await;
        assert!(matches!(still_held, Err(LockError::Contended { .. })));
        fresh.release().await;
    }

    #[tokio::test]
    async fn retry_succeeds_once_the_holder_releases() {
        let kv = KvStore::memory();
        let sender = sender();
        let cfg = GateConfig {
            lock_ttl: Duration::from_secs(3),
            lock_acquire_timeout: Duration::from_millis(120),
            lock_retry_attempts: 2,
            ..GateConfig::default()
        };

        let held = acquire(
            &kv,
            &sender,
            resources::STRIKES,
            cfg.lock_ttl,
            cfg.lock_acquire_timeout,
        )
        .await
        .unwrap();

        let kv_clone = kv.clone();
        let sender_clone = sender.clone();
        let waiter = tokio::spawn(async move {
            acquire_with_retry(&kv_clone, &sender_clone, resources::STRIKES, &cfg).await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        held.release().await;

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
        acquired.unwrap().release().await;
    }
}
