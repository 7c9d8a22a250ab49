use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use gatehouse_core::sender::Sender;

use crate::config::GateConfig;
use crate::kv::{KvError, KvStore};

const FALLBACK_DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaVerdict {
    Allowed,
    /// The sender hit their personal daily ceiling.
    SenderExceeded,
    /// The source address hit the shared daily ceiling.
    AddressExceeded,
}

/// Calendar date of `now` in the business timezone. Quota windows roll at
/// local midnight, not UTC midnight.
pub fn local_day(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Seconds from `now` until the next local midnight, used as the counter TTL.
pub fn until_local_midnight(now: DateTime<Utc>, tz: Tz) -> Duration {
    let local = now.with_timezone(&tz);
    let Some(next_day) = local.date_naive().succ_opt() else {
        return FALLBACK_DAY;
    };
    let Some(midnight_naive) = next_day.and_hms_opt(0, 0, 0) else {
        return FALLBACK_DAY;
    };
    // DST gaps around midnight are vanishingly rare; fall back to a flat day.
    let Some(midnight) = tz.from_local_datetime(&midnight_naive).earliest() else {
        return FALLBACK_DAY;
    };
    (midnight.with_timezone(&Utc) - now)
        .to_std()
        .unwrap_or(FALLBACK_DAY)
}

fn sender_quota_key(sender: &Sender, day: NaiveDate) -> String {
    format!("quota:sender:{}:{day}", sender.key())
}

fn address_quota_key(addr: &str, day: NaiveDate) -> String {
    format!("quota:addr:{addr}:{day}")
}

/// Daily quota check: two independent counters, per-sender (stricter) and
/// per-source-address, both resetting at local business midnight. Exceeding
/// either blocks the message without banning — a quota is a soft throttle,
/// not abuse.
///
/// The counters move only through the store's atomic `incr`, and the ceiling
/// is checked on the value that increment returned; concurrent messages for
/// one sender or one NAT address cannot lose counts.
pub async fn check_and_count(
    kv: &KvStore,
    sender: &Sender,
    addr: &str,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> Result<QuotaVerdict, KvError> {
    let day = local_day(now, cfg.business_timezone);
    let ttl = until_local_midnight(now, cfg.business_timezone);

    let sender_count = kv.incr(&sender_quota_key(sender, day), ttl).await?;
    if sender_count > i64::from(cfg.daily_sender_quota) {
        return Ok(QuotaVerdict::SenderExceeded);
    }
    let addr_count = kv.incr(&address_quota_key(addr, day), ttl).await?;
    if addr_count > i64::from(cfg.daily_address_quota) {
        return Ok(QuotaVerdict::AddressExceeded);
    }
    Ok(QuotaVerdict::Allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    const TZ: Tz = chrono_tz::Europe::Madrid;

    #[test]
    fn messages_around_local_midnight_land_in_different_days() {
        // 23:59:59 and 00:00:01 local time, expressed in UTC.
        let before = TZ
            .with_ymd_and_hms(2025, 6, 10, 23, 59, 59)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc);
        let after = TZ
            .with_ymd_and_hms(2025, 6, 11, 0, 0, 1)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc);

        assert_ne!(local_day(before, TZ), local_day(after, TZ));
    }

    #[test]
    fn utc_midnight_does_not_roll_the_local_day() {
        // Madrid is UTC+2 in June: 23:30 UTC is already the next local day.
        let utc_evening = Utc.with_ymd_and_hms(2025, 6, 10, 23, 30, 0).unwrap();
        assert_eq!(
            local_day(utc_evening, TZ),
            NaiveDate::from_ymd_opt(2025, 6, 11).unwrap()
        );
    }

    #[test]
    fn ttl_reaches_exactly_the_next_local_midnight() {
        let now = TZ
            .with_ymd_and_hms(2025, 6, 10, 23, 59, 59)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(until_local_midnight(now, TZ), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sender_ceiling_trips_before_address_ceiling() {
        let kv = KvStore::memory();
        let cfg = GateConfig {
            daily_sender_quota: 2,
            daily_address_quota: 5,
            ..GateConfig::default()
        };
        let sender = Sender::Customer(Uuid::now_v7());
        let now = Utc::now();

        for _ in 0..2 {
            assert_eq!(
                check_and_count(&kv, &sender, "10.0.0.1", &cfg, now).await.unwrap(),
                QuotaVerdict::Allowed
            );
        }
        assert_eq!(
            check_and_count(&kv, &sender, "10.0.0.1", &cfg, now).await.unwrap(),
            QuotaVerdict::SenderExceeded
        );
    }

    #[tokio::test]
    async fn shared_address_is_throttled_across_senders() {
        let kv = KvStore::memory();
        let cfg = GateConfig {
            daily_sender_quota: 2,
            daily_address_quota: 3,
            ..GateConfig::default()
        };
        let now = Utc::now();

        // Three different visitors behind one NAT address.
        for i in 0..3 {
            let sender = Sender::anonymous(&format!("sess-{i}")).unwrap();
            assert_eq!(
                check_and_count(&kv, &sender, "10.0.0.9", &cfg, now).await.unwrap(),
                QuotaVerdict::Allowed
            );
        }
        let fourth = Sender::anonymous("sess-3").unwrap();
        assert_eq!(
            check_and_count(&kv, &fourth, "10.0.0.9", &cfg, now).await.unwrap(),
            QuotaVerdict::AddressExceeded
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_cannot_outrun_the_sender_ceiling() {
        let kv = KvStore::memory();
        let cfg = GateConfig {
            daily_sender_quota: 30,
            daily_address_quota: 1000,
            ..GateConfig::default()
        };
        let sender = Sender::Customer(Uuid::now_v7());
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let kv = kv.clone();
            let cfg = cfg.clone();
            let sender = sender.clone();
            handles.push(tokio::spawn(async move {
                check_and_count(&kv, &sender, "10.0.0.1", &cfg, now).await.unwrap()
            }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() == QuotaVerdict::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 30);
    }

    #[tokio::test]
    async fn quota_resets_across_the_local_midnight_boundary() {
        let kv = KvStore::memory();
        let cfg = GateConfig {
            daily_sender_quota: 1,
            ..GateConfig::default()
        };
        let sender = Sender::Customer(Uuid::now_v7());
        // Anchor on the real clock: the memory store expires entries against
        // wall time, so a fabricated past timestamp would hand the counters an
        // already-elapsed TTL. Step back a minute if local midnight is close.
        let mut before = Utc::now();
        if until_local_midnight(before, TZ) < Duration::from_secs(10) {
            before -= chrono::Duration::seconds(60);
        }
        let after = before
            + chrono::Duration::from_std(until_local_midnight(before, TZ))
                .unwrap_or(chrono::Duration::seconds(0))
            + chrono::Duration::seconds(1);

        assert_ne!(local_day(before, TZ), local_day(after, TZ));

        assert_eq!(
            check_and_count(&kv, &sender, "10.0.0.1", &cfg, before).await.unwrap(),
            QuotaVerdict::Allowed
        );
        assert_eq!(
            check_and_count(&kv, &sender, "10.0.0.1", &cfg, before).await.unwrap(),
            QuotaVerdict::SenderExceeded
        );
        // Two seconds later the local date has changed and the count restarts.
        assert_eq!(
            check_and_count(&kv, &sender, "10.0.0.1", &cfg, after).await.unwrap(),
            QuotaVerdict::Allowed
        );
    }
}
