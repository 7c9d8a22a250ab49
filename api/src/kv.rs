use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

/// Shared low-latency keyed records for ephemeral admission state.
///
/// Every per-sender counter, ban flag, lock and cached reply lives here as a
/// keyed record with an explicit TTL, never as in-process state, so admission
/// decisions stay correct across multiple worker processes. The `Postgres`
/// arm (table `gate_kv`) is the shared production store; the `Memory` arm
/// backs tests and single-node development.
#[derive(Clone)]
pub enum KvStore {
    Postgres(PgPool),
    Memory(MemoryKv),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero())
}

impl KvStore {
    pub fn memory() -> Self {
        KvStore::Memory(MemoryKv::default())
    }

    pub fn postgres(pool: PgPool) -> Self {
        KvStore::Postgres(pool)
    }

    /// Read a live value. Expired entries are treated as absent.
    pub async fn get_json(&self, key: &str) -> Result<Option<Value>, KvError> {
        match self {
            KvStore::Postgres(pool) => {
                let value: Option<Value> = sqlx::query_scalar(
                    "SELECT value FROM gate_kv WHERE key = $1 AND expires_at > NOW()",
                )
                .bind(key)
                .fetch_optional(pool)
                .await?;
                Ok(value)
            }
            KvStore::Memory(mem) => {
                let now = Utc::now();
                let entries = mem.entries.read().await;
                Ok(entries
                    .get(key)
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| entry.value.clone()))
            }
        }
    }

    /// Unconditional upsert with a fresh TTL.
    pub async fn put_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), KvError> {
        match self {
            KvStore::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO gate_kv (key, value, expires_at)
                    VALUES ($1, $2, NOW() + $3::float8 * INTERVAL '1 second')
                    ON CONFLICT (key) DO UPDATE
                    SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(ttl.as_secs_f64())
                .execute(pool)
                .await?;
                Ok(())
            }
            KvStore::Memory(mem) => {
                let mut entries = mem.entries.write().await;
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.clone(),
                        expires_at: expiry(ttl),
                    },
                );
                Ok(())
            }
        }
    }

    /// Atomic counter increment with a fresh TTL. An expired counter restarts
    /// at 1. Returns the post-increment value, so callers check ceilings on
    /// the value this call produced, never on a separately-read one.
    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        match self {
            KvStore::Postgres(pool) => {
                let value: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO gate_kv (key, value, expires_at)
                    VALUES ($1, to_jsonb(1::bigint), NOW() + $2::float8 * INTERVAL '1 second')
                    ON CONFLICT (key) DO UPDATE
                    SET value = CASE
                            WHEN gate_kv.expires_at <= NOW() THEN to_jsonb(1::bigint)
                            ELSE to_jsonb((gate_kv.value #>> '{}')::bigint + 1)
                        END,
                        expires_at = EXCLUDED.expires_at
                    RETURNING (value #>> '{}')::bigint
                    "#,
                )
                .bind(key)
                .bind(ttl.as_secs_f64())
                .fetch_one(pool)
                .await?;
                Ok(value)
            }
            KvStore::Memory(mem) => {
                // Read-modify-write inside one write-lock critical section.
                let now = Utc::now();
                let mut entries = mem.entries.write().await;
                let current = entries
                    .get(key)
                    .filter(|entry| entry.is_live(now))
                    .and_then(|entry| entry.value.as_i64())
                    .unwrap_or(0);
                let next = current + 1;
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: Value::from(next),
                        expires_at: expiry(ttl),
                    },
                );
                Ok(next)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.delete_many(std::slice::from_ref(&key.to_string())).await
    }

    /// Single-statement delete of several keys. Ban enforcement relies on this
    /// to clear strikes, history and velocity state together.
    pub async fn delete_many(&self, keys: &[String]) -> Result<(), KvError> {
        match self {
            KvStore::Postgres(pool) => {
                sqlx::query("DELETE FROM gate_kv WHERE key = ANY($1)")
                    .bind(keys)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            KvStore::Memory(mem) => {
                let mut entries = mem.entries.write().await;
                for key in keys {
                    entries.remove(key);
                }
                Ok(())
            }
        }
    }

    /// Atomic compare-and-set: claim `key` with `token` iff no live claim
    /// exists. An expired claim is overwritten in the same statement, so a
    /// crashed holder never deadlocks the key.
    pub async fn try_claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, KvError> {
        match self {
            KvStore::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO gate_kv (key, value, expires_at)
                    VALUES ($1, to_jsonb($2::text), NOW() + $3::float8 * INTERVAL '1 second')
                    ON CONFLICT (key) DO UPDATE
                    SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                    WHERE gate_kv.expires_at <= NOW()
                    "#,
                )
                .bind(key)
                .bind(token)
                .bind(ttl.as_secs_f64())
                .execute(pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
            KvStore::Memory(mem) => {
                let now = Utc::now();
                let mut entries = mem.entries.write().await;
                if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
                    return Ok(false);
                }
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: Value::String(token.to_string()),
                        expires_at: expiry(ttl),
                    },
                );
                Ok(true)
            }
        }
    }

    /// Release a claim only if the stored token still matches. Returns whether
    /// anything was released.
    pub async fn release_claim(&self, key: &str, token: &str) -> Result<bool, KvError> {
        match self {
            KvStore::Postgres(pool) => {
                let result =
                    sqlx::query("DELETE FROM gate_kv WHERE key = $1 AND value = to_jsonb($2::text)")
                        .bind(key)
                        .bind(token)
                        .execute(pool)
                        .await?;
                Ok(result.rows_affected() == 1)
            }
            KvStore::Memory(mem) => {
                let mut entries = mem.entries.write().await;
                let matches = entries
                    .get(key)
                    .is_some_and(|entry| entry.value == Value::String(token.to_string()));
                if matches {
                    entries.remove(key);
                }
                Ok(matches)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = KvStore::memory();
        kv.put_json("k", &json!({"n": 1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(kv.get_json("k").await.unwrap(), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let kv = KvStore::memory();
        kv.put_json("k", &json!(1), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get_json("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn claim_is_exclusive_while_live() {
        let kv = KvStore::memory();
        assert!(kv.try_claim("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.try_claim("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_claim_can_be_taken_over() {
        let kv = KvStore::memory();
        assert!(kv.try_claim("lock", "a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.try_claim("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let kv = KvStore::memory();
        kv.try_claim("lock", "a", Duration::from_secs(5)).await.unwrap();
        assert!(!kv.release_claim("lock", "someone-else").await.unwrap());
        assert!(kv.release_claim("lock", "a").await.unwrap());
        // Released: a new claim succeeds immediately.
        assert!(kv.try_claim("lock", "c", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_up_and_restarts_after_expiry() {
        let kv = KvStore::memory();
        assert_eq!(kv.incr("n", Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(kv.incr("n", Duration::from_secs(5)).await.unwrap(), 2);
        kv.put_json("m", &json!(7), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.incr("m", Duration::from_secs(5)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_all_land() {
        let kv = KvStore::memory();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.incr("counter", Duration::from_secs(60)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(kv.get_json("counter").await.unwrap(), Some(json!(50)));
    }

    #[tokio::test]
    async fn delete_many_clears_all_keys() {
        let kv = KvStore::memory();
        for key in ["a", "b", "c"] {
            kv.put_json(key, &json!(true), Duration::from_secs(5))
                .await
                .unwrap();
        }
        kv.delete_many(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(kv.get_json("a").await.unwrap(), None);
        assert_eq!(kv.get_json("b").await.unwrap(), None);
        assert_eq!(kv.get_json("c").await.unwrap(), Some(json!(true)));
    }
}
