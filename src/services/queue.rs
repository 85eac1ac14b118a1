use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::services::clock::Clock;
use crate::services::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the attempt that just failed: `base ×
    /// 2^(attempts−1)`, capped.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 20) as u32;
        let millis = (self.backoff_base.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(millis).min(self.backoff_cap)
    }
}

/// A leased entry handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub due: DateTime<Utc>,
    pub attempts: i32,
    pub lease_until: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Lease {
    Leased(QueuedJob),
    Empty,
    /// Nothing due yet; the earliest instant at which work could appear
    /// (a future due-time or a lease expiry).
    WaitUntil(DateTime<Utc>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retried { next_due: DateTime<Utc> },
    Permanent,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Entry {
    campaign_id: Uuid,
    due: DateTime<Utc>,
    attempts: i32,
    lease_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    /// Due-time order, ties broken by job id.
    ordered: BTreeSet<(DateTime<Utc>, Uuid)>,
    /// Ids that already left the active set; enqueue is a no-op for them.
    terminal: HashSet<Uuid>,
    completed: u64,
    failed: u64,
}

/// Durable-enough delayed-job register. State is volatile; the Store is the
/// recovery source of truth and `recover_from_store` rebuilds everything on
/// boot. A lease is a timestamp, not a held lock: when the holder dies the
/// entry becomes leasable again as soon as `lease_until` passes.
pub struct DelayQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    lease_duration: Duration,
}

impl DelayQueue {
    pub fn new(clock: Arc<dyn Clock>, policy: RetryPolicy, lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            clock,
            policy,
            lease_duration,
        }
    }

    /// Idempotent on job id: an id already present in any state (queued,
    /// leased, or already terminal) is left untouched. Returns whether the
    /// job was admitted.
    pub fn enqueue(
        &self,
        job_id: Uuid,
        campaign_id: Uuid,
        due: DateTime<Utc>,
        attempts: i32,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&job_id) || inner.terminal.contains(&job_id) {
            return false;
        }
        inner.entries.insert(
            job_id,
            Entry {
                campaign_id,
                due,
                attempts,
                lease_until: None,
            },
        );
        inner.ordered.insert((due, job_id));
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// Earliest job whose due-time has passed and whose lease is absent or
    /// expired. When nothing is ready, reports the next instant worth
    /// polling at.
    pub fn lease_next(&self) -> Lease {
        let now = self.clock.now();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let mut wake: Option<DateTime<Utc>> = None;
        let mut chosen: Option<Uuid> = None;

        for &(due, id) in inner.ordered.iter() {
            if due > now {
                wake = Some(wake.map_or(due, |w| w.min(due)));
                break;
            }
            let entry = &inner.entries[&id];
            match entry.lease_until {
                Some(lease) if lease > now => {
                    wake = Some(wake.map_or(lease, |w| w.min(lease)));
                }
                _ => {
                    chosen = Some(id);
                    break;
                }
            }
        }

        if let Some(id) = chosen {
            let lease_until = now + chrono::Duration::from_std(self.lease_duration).unwrap();
            let entry = inner.entries.get_mut(&id).unwrap();
            entry.lease_until = Some(lease_until);
            return Lease::Leased(QueuedJob {
                id,
                campaign_id: entry.campaign_id,
                due: entry.due,
                attempts: entry.attempts,
                lease_until,
            });
        }

        match wake {
            Some(t) => Lease::WaitUntil(t),
            None if inner.entries.is_empty() => Lease::Empty,
            // Everything is leased out with no due-time ahead of us; wake at
            // the earliest lease expiry.
            None => {
                let earliest = inner
                    .entries
                    .values()
                    .filter_map(|e| e.lease_until)
                    .min();
                match earliest {
                    Some(t) => Lease::WaitUntil(t),
                    None => Lease::Empty,
                }
            }
        }
    }

    /// Remove from the active set (sent, or failed without retry budget
    /// spent here).
    pub fn complete(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(&job_id) {
            inner.ordered.remove(&(entry.due, job_id));
            inner.terminal.insert(job_id);
            inner.completed += 1;
        }
    }

    /// Push a job's due-time out (rate deferral) and release its lease.
    /// `scheduled_time` on the Store row is untouched.
    pub fn defer(&self, job_id: Uuid, until: DateTime<Utc>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return;
        };
        let old = (entry.due, job_id);
        entry.due = until;
        entry.lease_until = None;
        inner.ordered.remove(&old);
        inner.ordered.insert((until, job_id));
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Record a failed attempt. Re-queues with exponential backoff while the
    /// retry budget lasts, otherwise removes the job from the active set.
    pub fn fail(&self, job_id: Uuid) -> FailOutcome {
        let now = self.clock.now();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return FailOutcome::Permanent;
        };
        entry.attempts += 1;
        if entry.attempts < self.policy.max_attempts {
            let backoff = self.policy.backoff(entry.attempts);
            let next_due = now + chrono::Duration::from_std(backoff).unwrap();
            let old = (entry.due, job_id);
            entry.due = next_due;
            entry.lease_until = None;
            inner.ordered.remove(&old);
            inner.ordered.insert((next_due, job_id));
            drop(guard);
            self.notify.notify_waiters();
            FailOutcome::Retried { next_due }
        } else {
            let entry = inner.entries.remove(&job_id).unwrap();
            inner.ordered.remove(&(entry.due, job_id));
            inner.terminal.insert(job_id);
            inner.failed += 1;
            FailOutcome::Permanent
        }
    }

    /// Retire a job whose failure was classified non-retryable: no backoff,
    /// straight out of the active set.
    pub fn fail_permanent(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(&job_id) {
            inner.ordered.remove(&(entry.due, job_id));
            inner.terminal.insert(job_id);
            inner.failed += 1;
        }
    }

    /// Re-enqueue every pending Store job whose lease is absent or expired,
    /// with `due = max(scheduled_time, now)`. Idempotent; doubles as the
    /// periodic reconciler sweep.
    pub async fn recover_from_store(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let jobs = store.load_pending_jobs(None).await?;
        let now = self.clock.now();
        let mut recovered = 0;
        for job in jobs {
            let lease_live = job.lease_until.map_or(false, |l| l > now);
            if lease_live {
                continue;
            }
            let due = job.scheduled_time.max(now);
            if self.enqueue(job.id, job.campaign_id, due, job.attempts) {
                debug!(job_id = %job.id, due = %due, "recovered pending job into queue");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        let mut waiting = 0;
        let mut active = 0;
        let mut delayed = 0;
        for entry in inner.entries.values() {
            if entry.lease_until.map_or(false, |l| l > now) {
                active += 1;
            } else if entry.due > now {
                delayed += 1;
            } else {
                waiting += 1;
            }
        }
        QueueStats {
            waiting,
            active,
            delayed,
            completed: inner.completed,
            failed: inner.failed,
        }
    }

    /// Resolves when new work may have become leasable.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::test_support::MemoryStore;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        ))
    }

    fn queue(clock: Arc<ManualClock>) -> DelayQueue {
        DelayQueue::new(clock, RetryPolicy::default(), Duration::from_secs(60))
    }

    #[test]
    fn enqueue_is_idempotent() {
        let clock = clock();
        let q = queue(clock.clone());
        let id = Uuid::new_v4();
        let campaign = Uuid::new_v4();
        assert!(q.enqueue(id, campaign, clock.now(), 0));
        assert!(!q.enqueue(id, campaign, clock.now(), 0));
        assert_eq!(q.stats().waiting, 1);
    }

    #[test]
    fn lease_orders_by_due_then_id() {
        let clock = clock();
        let q = queue(clock.clone());
        let now = clock.now();
        let campaign = Uuid::new_v4();

        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        q.enqueue(late, campaign, now, 0);
        q.enqueue(early, campaign, now - chrono::Duration::seconds(5), 0);

        match q.lease_next() {
            Lease::Leased(job) => assert_eq!(job.id, early),
            other => panic!("expected lease, got {:?}", other),
        }

        // Same due-time: lower id first.
        let q2 = queue(clock.clone());
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        q2.enqueue(b, campaign, now, 0);
        q2.enqueue(a, campaign, now, 0);
        match q2.lease_next() {
            Lease::Leased(job) => assert_eq!(job.id, a),
            other => panic!("expected lease, got {:?}", other),
        }
    }

    #[test]
    fn future_jobs_report_wait_until() {
        let clock = clock();
        let q = queue(clock.clone());
        let due = clock.now() + chrono::Duration::seconds(30);
        q.enqueue(Uuid::new_v4(), Uuid::new_v4(), due, 0);

        match q.lease_next() {
            Lease::WaitUntil(t) => assert_eq!(t, due),
            other => panic!("expected WaitUntil, got {:?}", other),
        }
        assert_eq!(q.stats().delayed, 1);
    }

    #[test]
    fn empty_queue_reports_empty() {
        let q = queue(clock());
        assert!(matches!(q.lease_next(), Lease::Empty));
    }

    #[test]
    fn expired_lease_makes_job_leasable_again() {
        let clock = clock();
        let q = queue(clock.clone());
        let id = Uuid::new_v4();
        q.enqueue(id, Uuid::new_v4(), clock.now(), 0);

        let first = match q.lease_next() {
            Lease::Leased(job) => job,
            other => panic!("expected lease, got {:?}", other),
        };

        // While the lease is live the queue reports its expiry as the next
        // instant worth checking.
        match q.lease_next() {
            Lease::WaitUntil(t) => assert_eq!(t, first.lease_until),
            other => panic!("expected WaitUntil, got {:?}", other),
        }

        clock.advance(Duration::from_secs(61));
        match q.lease_next() {
            Lease::Leased(job) => assert_eq!(job.id, id),
            other => panic!("expected re-lease, got {:?}", other),
        }
    }

    #[test]
    fn completed_jobs_are_never_readmitted() {
        let clock = clock();
        let q = queue(clock.clone());
        let id = Uuid::new_v4();
        let campaign = Uuid::new_v4();
        q.enqueue(id, campaign, clock.now(), 0);
        q.complete(id);

        assert!(!q.enqueue(id, campaign, clock.now(), 0));
        assert!(matches!(q.lease_next(), Lease::Empty));
        assert_eq!(q.stats().completed, 1);
    }

    #[test]
    fn fail_backs_off_exponentially_then_goes_permanent() {
        let clock = clock();
        let q = queue(clock.clone());
        let id = Uuid::new_v4();
        q.enqueue(id, Uuid::new_v4(), clock.now(), 0);

        let now = clock.now();
        assert_eq!(
            q.fail(id),
            FailOutcome::Retried {
                next_due: now + chrono::Duration::seconds(2)
            }
        );
        assert_eq!(
            q.fail(id),
            FailOutcome::Retried {
                next_due: now + chrono::Duration::seconds(4)
            }
        );
        assert_eq!(q.fail(id), FailOutcome::Permanent);
        assert_eq!(q.stats().failed, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 30,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(25), Duration::from_secs(15 * 60));
    }

    #[test]
    fn defer_pushes_due_out_and_releases_lease() {
        let clock = clock();
        let q = queue(clock.clone());
        let id = Uuid::new_v4();
        q.enqueue(id, Uuid::new_v4(), clock.now(), 0);

        assert!(matches!(q.lease_next(), Lease::Leased(_)));
        let until = clock.now() + chrono::Duration::minutes(45);
        q.defer(id, until);

        match q.lease_next() {
            Lease::WaitUntil(t) => assert_eq!(t, until),
            other => panic!("expected WaitUntil, got {:?}", other),
        }

        clock.set(until);
        assert!(matches!(q.lease_next(), Lease::Leased(_)));
    }

    #[tokio::test]
    async fn recover_skips_live_leases_and_clamps_past_due_times() {
        let clock = clock();
        let store = MemoryStore::new();
        let now = clock.now();

        let campaign = crate::services::test_support::campaign_fixture("u1", now, 3);
        let mut jobs = crate::services::test_support::job_fixtures(&campaign, &["a@x.io", "b@x.io", "c@x.io"]);
        // One job far in the past, one with a live lease, one in the future.
        jobs[0].scheduled_time = now - chrono::Duration::hours(1);
        jobs[1].lease_until = Some(now + chrono::Duration::seconds(30));
        jobs[2].scheduled_time = now + chrono::Duration::minutes(5);
        store.create_campaign_with_jobs(&campaign, &jobs).await.unwrap();

        let q = queue(clock.clone());
        let recovered = q.recover_from_store(&store).await.unwrap();
        assert_eq!(recovered, 2);

        // The past job is due now, not an hour ago.
        match q.lease_next() {
            Lease::Leased(job) => {
                assert_eq!(job.id, jobs[0].id);
                assert_eq!(job.due, now);
            }
            other => panic!("expected lease, got {:?}", other),
        }
    }
}
