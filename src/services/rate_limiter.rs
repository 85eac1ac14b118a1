use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::warn;

use crate::services::clock::Clock;
use crate::services::kv::{Kv, KvError};
use crate::services::store::Store;

/// Hour plus a 60s overlap so a bucket outlives its own window.
const COUNTER_TTL: Duration = Duration::from_secs(3660);

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: i64,
    pub next_bucket_start: DateTime<Utc>,
}

/// Rolling, hour-aligned send budget per sender identity. The KV counter is
/// authoritative within the hour; the Store mirror exists only to reseed KV
/// after eviction. `check` followed by `increment` is deliberately not
/// atomic: two workers may both pass `check`, so the budget can overshoot
/// by at most (worker concurrency − 1).
pub struct RateLimiter {
    kv: Arc<dyn Kv>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

pub fn hour_bucket(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H").to_string()
}

pub fn bucket_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

pub fn next_bucket_start(t: DateTime<Utc>) -> DateTime<Utc> {
    bucket_start(t) + chrono::Duration::hours(1)
}

fn counter_key(bucket: &str, sender: &str) -> String {
    format!("rate-limit:{}:{}", bucket, sender)
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn Kv>, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, store, clock }
    }

    pub async fn check(&self, sender: &str, limit: i64) -> Result<RateDecision, KvError> {
        let now = self.clock.now();
        let bucket = hour_bucket(now);
        let key = counter_key(&bucket, sender);

        let current = match self.kv.get_counter(&key).await? {
            Some(count) => count,
            None => self.reseed(&bucket, sender, &key).await,
        };

        Ok(RateDecision {
            allowed: current < limit,
            current,
            next_bucket_start: next_bucket_start(now),
        })
    }

    /// Count one send against the sender's current bucket. The Store mirror
    /// is best-effort: a mirror failure is logged and the KV count stands.
    pub async fn increment(&self, sender: &str) -> Result<i64, KvError> {
        let now = self.clock.now();
        let bucket = hour_bucket(now);
        let key = counter_key(&bucket, sender);

        let count = self.kv.incr(&key, COUNTER_TTL).await?;

        if let Err(e) = self.store.upsert_rate_counter(&bucket, sender, count).await {
            warn!(sender, bucket, error = %e, "rate counter mirror write failed");
        }

        Ok(count)
    }

    /// KV lost the bucket (eviction or first touch): fall back to the Store
    /// mirror, writing the value back into KV when it is non-zero.
    async fn reseed(&self, bucket: &str, sender: &str, key: &str) -> i64 {
        let seeded = match self.store.read_rate_counter(bucket, sender).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                warn!(sender, bucket, error = %e, "rate counter reseed read failed");
                0
            }
        };
        if seeded > 0 {
            if let Err(e) = self.kv.set_counter(key, seeded, COUNTER_TTL).await {
                warn!(sender, bucket, error = %e, "rate counter reseed write failed");
            }
        }
        seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::test_support::{MemoryKv, MemoryStore};
    use chrono::TimeZone;

    const SENDER: &str = "noreply@reachinbox.app";

    fn setup() -> (Arc<ManualClock>, Arc<MemoryKv>, Arc<MemoryStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap(),
        ));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(kv.clone(), store.clone(), clock.clone());
        (clock, kv, store, limiter)
    }

    #[test]
    fn bucket_is_utc_hour_truncation() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 59, 59).unwrap();
        assert_eq!(hour_bucket(t), "2024-05-01T10");
        assert_eq!(
            next_bucket_start(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn check_increment_check_moves_current_by_one() {
        let (_clock, _kv, _store, limiter) = setup();

        let before = limiter.check(SENDER, 10).await.unwrap();
        assert!(before.allowed);
        assert_eq!(before.current, 0);

        limiter.increment(SENDER).await.unwrap();

        let after = limiter.check(SENDER, 10).await.unwrap();
        assert_eq!(after.current, before.current + 1);
    }

    #[tokio::test]
    async fn denies_once_limit_reached_and_points_at_next_bucket() {
        let (clock, _kv, _store, limiter) = setup();

        for _ in 0..2 {
            limiter.increment(SENDER).await.unwrap();
        }
        let decision = limiter.check(SENDER, 2).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.current, 2);
        assert_eq!(
            decision.next_bucket_start,
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()
        );

        // A new hour opens a new bucket.
        clock.set(decision.next_bucket_start);
        let fresh = limiter.check(SENDER, 2).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.current, 0);
    }

    #[tokio::test]
    async fn reseeds_from_store_mirror_after_eviction() {
        let (clock, kv, _store, limiter) = setup();

        for _ in 0..3 {
            limiter.increment(SENDER).await.unwrap();
        }

        let bucket = hour_bucket(clock.now());
        kv.evict(&counter_key(&bucket, SENDER));

        let decision = limiter.check(SENDER, 10).await.unwrap();
        assert_eq!(decision.current, 3);

        // The reseed wrote the counter back into KV.
        let cached = kv
            .get_counter(&counter_key(&bucket, SENDER))
            .await
            .unwrap();
        assert_eq!(cached, Some(3));
    }

    #[tokio::test]
    async fn counter_expires_with_its_bucket() {
        let (clock, kv, _store, limiter) = setup();

        limiter.increment(SENDER).await.unwrap();
        let bucket = hour_bucket(clock.now());

        clock.advance(Duration::from_secs(3661));
        let cached = kv
            .get_counter(&counter_key(&bucket, SENDER))
            .await
            .unwrap();
        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn mirror_failure_does_not_fail_increment() {
        let (_clock, _kv, store, limiter) = setup();

        store.fail_next_writes(1);
        let count = limiter.increment(SENDER).await.unwrap();
        assert_eq!(count, 1);
    }
}
