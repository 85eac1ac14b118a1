use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::campaign::Campaign;
use crate::models::job::{Job, JobPatch, JobStatus};
use crate::services::aggregator::AggregatorHandle;
use crate::services::clock::Clock;
use crate::services::mailer::{Mailer, MailerError, OutboundEmail};
use crate::services::queue::{DelayQueue, FailOutcome, Lease, QueuedJob};
use crate::services::rate_limiter::RateLimiter;
use crate::services::store::{Store, StoreError};

/// What happened to one leased job, decided in `execute`.
#[derive(Debug)]
pub enum SendOutcome {
    Sent { message_id: String },
    DeferredUntil(DateTime<Utc>),
    RetryableFailure(String),
    PermanentFailure(String),
}

/// The worker halted because the Store stayed unavailable through the retry
/// budget. The lease is left to expire so the job is re-attempted later.
#[derive(Debug)]
pub struct StoreDown;

#[derive(Clone)]
pub struct WorkerSettings {
    /// Envelope-from identity the hourly budget is counted against.
    pub sender: String,
    /// Post-send pacing floor; the campaign's own `delay_ms` wins when
    /// larger.
    pub pacing_floor: Duration,
    /// Deferral applied when the KV counter store is unreachable.
    pub kv_retry_delay: Duration,
}

pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<DelayQueue>,
    pub limiter: Arc<RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
    pub aggregator: AggregatorHandle,
    pub healthy: Arc<AtomicBool>,
    pub settings: WorkerSettings,
}

pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|worker_id| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_worker(ctx, worker_id, shutdown))
        })
        .collect()
}

pub async fn run_worker(
    ctx: Arc<WorkerContext>,
    worker_id: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx.queue.lease_next() {
            Lease::Leased(leased) => {
                if process_one(&ctx, &leased).await.is_err() {
                    ctx.healthy.store(false, Ordering::SeqCst);
                    error!(worker_id, job_id = %leased.id, "store unavailable, worker halting");
                    break;
                }
            }
            Lease::Empty => {
                tokio::select! {
                    _ = ctx.queue.wait_for_work() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Lease::WaitUntil(t) => {
                tokio::select! {
                    _ = ctx.clock.sleep_until(t) => {}
                    _ = ctx.queue.wait_for_work() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    info!(worker_id, "worker stopped");
}

/// Drive one leased job through rate-limiting, delivery and the Store
/// transition. Every Store write here is must-succeed: the send is only
/// attempted once intent (the lease) is durably recorded.
pub async fn process_one(ctx: &WorkerContext, leased: &QueuedJob) -> Result<(), StoreDown> {
    let Some(job) = load_job(ctx, leased.id).await? else {
        warn!(job_id = %leased.id, "leased job has no store row, dropping");
        ctx.queue.complete(leased.id);
        return Ok(());
    };

    if job.status() != JobStatus::Pending {
        // A late duplicate: the job already reached a terminal state.
        warn!(job_id = %job.id, status = %job.status, "leased job already terminal, not re-sending");
        ctx.queue.complete(job.id);
        return Ok(());
    }

    let Some(campaign) = load_campaign(ctx, job.campaign_id).await? else {
        warn!(job_id = %job.id, campaign_id = %job.campaign_id, "job without campaign, dropping");
        ctx.queue.complete(job.id);
        return Ok(());
    };

    // Record the lease before touching the relay.
    match update_job(ctx, job.id, JobPatch::lease(leased.lease_until)).await {
        Ok(()) => {}
        Err(UpdateFailure::CasLost) => {
            ctx.queue.complete(job.id);
            return Ok(());
        }
        Err(UpdateFailure::Down) => return Err(StoreDown),
    }

    let attempts = job.attempts + 1;
    match execute(ctx, &job, &campaign).await {
        SendOutcome::Sent { message_id } => {
            let now = ctx.clock.now();
            match update_job(ctx, job.id, JobPatch::sent(now, attempts)).await {
                Ok(()) => {}
                Err(UpdateFailure::CasLost) => {
                    warn!(job_id = %job.id, "sent job was transitioned concurrently");
                    ctx.queue.complete(job.id);
                    return Ok(());
                }
                Err(UpdateFailure::Down) => return Err(StoreDown),
            }
            ctx.queue.complete(job.id);
            ctx.aggregator.notify(job.campaign_id);
            info!(
                job_id = %job.id,
                campaign_id = %job.campaign_id,
                recipient = %job.recipient,
                message_id,
                attempts,
                "email sent"
            );
            let pacing = pacing_delay(&campaign, ctx.settings.pacing_floor);
            if !pacing.is_zero() {
                ctx.clock.sleep(pacing).await;
            }
        }
        SendOutcome::DeferredUntil(until) => {
            match update_job(ctx, job.id, JobPatch::clear_lease()).await {
                Ok(()) => {}
                Err(UpdateFailure::CasLost) => {
                    ctx.queue.complete(job.id);
                    return Ok(());
                }
                Err(UpdateFailure::Down) => return Err(StoreDown),
            }
            ctx.queue.defer(job.id, until);
            info!(job_id = %job.id, until = %until, "send deferred");
        }
        SendOutcome::RetryableFailure(err) => match ctx.queue.fail(job.id) {
            FailOutcome::Retried { next_due } => {
                let patch = JobPatch {
                    attempts: Some(attempts),
                    last_error: Some(err.clone()),
                    lease_until: Some(None),
                    ..Default::default()
                };
                match update_job(ctx, job.id, patch).await {
                    Ok(()) => {}
                    Err(UpdateFailure::CasLost) => {
                        ctx.queue.complete(job.id);
                        return Ok(());
                    }
                    Err(UpdateFailure::Down) => return Err(StoreDown),
                }
                warn!(
                    job_id = %job.id,
                    attempts,
                    next_due = %next_due,
                    error = %err,
                    "send failed, will retry"
                );
            }
            FailOutcome::Permanent => {
                match update_job(ctx, job.id, JobPatch::failed(err.clone(), attempts)).await {
                    Ok(()) => {}
                    Err(UpdateFailure::CasLost) => {
                        ctx.queue.complete(job.id);
                        return Ok(());
                    }
                    Err(UpdateFailure::Down) => return Err(StoreDown),
                }
                ctx.aggregator.notify(job.campaign_id);
                warn!(job_id = %job.id, attempts, error = %err, "retry budget exhausted, job failed");
            }
        },
        SendOutcome::PermanentFailure(err) => {
            match update_job(ctx, job.id, JobPatch::failed(err.clone(), attempts)).await {
                Ok(()) => {}
                Err(UpdateFailure::CasLost) => {
                    ctx.queue.complete(job.id);
                    return Ok(());
                }
                Err(UpdateFailure::Down) => return Err(StoreDown),
            }
            ctx.queue.fail_permanent(job.id);
            ctx.aggregator.notify(job.campaign_id);
            warn!(job_id = %job.id, error = %err, "permanent transport failure, job failed");
        }
    }

    Ok(())
}

/// Rate-check, count, and hand the message to the relay. Increment happens
/// before the send so budget overshoot is bounded by worker concurrency,
/// not relay latency.
async fn execute(ctx: &WorkerContext, job: &Job, campaign: &Campaign) -> SendOutcome {
    let limit = campaign.hourly_limit.max(1) as i64;
    let decision = match ctx.limiter.check(&ctx.settings.sender, limit).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "rate counter unavailable, deferring");
            let retry_at =
                ctx.clock.now() + chrono::Duration::from_std(ctx.settings.kv_retry_delay).unwrap();
            return SendOutcome::DeferredUntil(retry_at);
        }
    };

    if !decision.allowed {
        return SendOutcome::DeferredUntil(decision.next_bucket_start);
    }

    if let Err(e) = ctx.limiter.increment(&ctx.settings.sender).await {
        // The check already passed; a lost increment under-counts by one,
        // which the advisory budget tolerates.
        warn!(job_id = %job.id, error = %e, "rate counter increment failed");
    }

    let email = compose(&ctx.settings.sender, campaign, &job.recipient);
    match ctx.mailer.send(&email).await {
        Ok(message_id) => SendOutcome::Sent { message_id },
        Err(MailerError::Transient(e)) => SendOutcome::RetryableFailure(e),
        Err(MailerError::Permanent(e)) => SendOutcome::PermanentFailure(e),
    }
}

fn compose(sender: &str, campaign: &Campaign, recipient: &str) -> OutboundEmail {
    OutboundEmail {
        from: sender.to_string(),
        to: recipient.to_string(),
        subject: campaign.subject.clone(),
        body_html: campaign.body.clone(),
        attachments: campaign.attachments.0.clone(),
    }
}

fn pacing_delay(campaign: &Campaign, floor: Duration) -> Duration {
    Duration::from_millis(campaign.delay_ms.max(0) as u64).max(floor)
}

enum UpdateFailure {
    CasLost,
    Down,
}

async fn load_job(ctx: &WorkerContext, id: uuid::Uuid) -> Result<Option<Job>, StoreDown> {
    let store = ctx.store.clone();
    store_retry(&ctx.clock, move || {
        let store = store.clone();
        async move { store.read_job(id).await }
    })
    .await
    .map_err(|_| StoreDown)
}

async fn load_campaign(
    ctx: &WorkerContext,
    id: uuid::Uuid,
) -> Result<Option<Campaign>, StoreDown> {
    let store = ctx.store.clone();
    store_retry(&ctx.clock, move || {
        let store = store.clone();
        async move { store.read_campaign(id).await }
    })
    .await
    .map_err(|_| StoreDown)
}

async fn update_job(
    ctx: &WorkerContext,
    id: uuid::Uuid,
    patch: JobPatch,
) -> Result<(), UpdateFailure> {
    let store = ctx.store.clone();
    let result = store_retry(&ctx.clock, move || {
        let store = store.clone();
        let patch = patch.clone();
        async move { store.update_job(id, patch, JobStatus::Pending).await }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        // Row gone or transitioned concurrently: either way the transition
        // is not ours to make.
        Err(StoreError::CasMismatch) | Err(StoreError::NotFound) => Err(UpdateFailure::CasLost),
        Err(_) => Err(UpdateFailure::Down),
    }
}

/// Bounded in-place retry for must-succeed Store calls. Only transient
/// unavailability is retried.
async fn store_retry<T, F, Fut>(clock: &Arc<dyn Clock>, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(StoreError::Unavailable(e)) if attempt < 2 => {
                attempt += 1;
                warn!(error = %e, attempt, "store write failed, retrying");
                clock.sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::queue::RetryPolicy;
    use crate::services::rate_limiter;
    use crate::services::test_support::{
        campaign_fixture, job_fixtures, FakeMailer, MemoryKv, MemoryStore,
    };
    use chrono::TimeZone;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        mailer: Arc<FakeMailer>,
        ctx: Arc<WorkerContext>,
        notifications: UnboundedReceiver<Uuid>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let mailer = Arc::new(FakeMailer::new(clock.clone()));
        let queue = Arc::new(DelayQueue::new(
            clock.clone(),
            RetryPolicy::default(),
            Duration::from_secs(60),
        ));
        let limiter = Arc::new(RateLimiter::new(kv, store.clone(), clock.clone()));
        let (aggregator, notifications) = AggregatorHandle::test_pair();

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue,
            limiter,
            mailer: mailer.clone(),
            clock: clock.clone(),
            aggregator,
            healthy: Arc::new(AtomicBool::new(true)),
            settings: WorkerSettings {
                sender: "noreply@reachinbox.app".to_string(),
                pacing_floor: Duration::ZERO,
                kv_retry_delay: Duration::from_secs(30),
            },
        });

        Harness {
            clock,
            store,
            mailer,
            ctx,
            notifications,
        }
    }

    async fn seed(h: &Harness, recipients: &[&str], hourly_limit: i32) -> (Uuid, Vec<Uuid>) {
        let campaign = {
            let mut c = campaign_fixture("u1", h.clock.now(), recipients.len() as i32);
            c.hourly_limit = hourly_limit;
            c
        };
        let jobs = job_fixtures(&campaign, recipients);
        h.store
            .create_campaign_with_jobs(&campaign, &jobs)
            .await
            .unwrap();
        for job in &jobs {
            h.ctx
                .queue
                .enqueue(job.id, campaign.id, job.scheduled_time, 0);
        }
        (campaign.id, jobs.iter().map(|j| j.id).collect())
    }

    fn lease(h: &Harness) -> QueuedJob {
        match h.ctx.queue.lease_next() {
            Lease::Leased(job) => job,
            other => panic!("expected a leasable job, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn happy_path_sends_and_records_terminal_state() {
        let mut h = harness();
        let (campaign_id, job_ids) = seed(&h, &["a@x.io"], 10).await;

        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "sent");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.sent_time, Some(h.clock.now()));
        assert_eq!(job.lease_until, None);
        assert_eq!(h.mailer.send_count("a@x.io"), 1);
        assert_eq!(h.ctx.queue.stats().completed, 1);
        assert_eq!(h.notifications.recv().await, Some(campaign_id));
    }

    #[tokio::test]
    async fn transient_failure_retries_with_backoff_then_succeeds() {
        let mut h = harness();
        let (campaign_id, job_ids) = seed(&h, &["b@x.io"], 10).await;
        h.mailer.script_outcome(
            "b@x.io",
            Err(MailerError::Transient("451 try later".to_string())),
        );

        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("451 try later"));

        // Backoff for the first failure is 2s.
        match h.ctx.queue.lease_next() {
            Lease::WaitUntil(t) => {
                assert_eq!(t, h.clock.now() + chrono::Duration::seconds(2))
            }
            other => panic!("expected WaitUntil, got {:?}", other),
        }

        h.clock.advance(Duration::from_secs(2));
        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "sent");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.sent_time, Some(h.clock.now()));
        assert_eq!(h.mailer.send_count("b@x.io"), 2);
        assert_eq!(h.notifications.recv().await, Some(campaign_id));
    }

    #[tokio::test]
    async fn permanent_failure_fails_immediately_without_retry() {
        let mut h = harness();
        let (campaign_id, job_ids) = seed(&h, &["dead@x.io"], 10).await;
        h.mailer.script_outcome(
            "dead@x.io",
            Err(MailerError::Permanent("550 no such user".to_string())),
        );

        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("550 no such user"));
        assert_eq!(h.mailer.send_count("dead@x.io"), 1);
        assert_eq!(h.ctx.queue.stats().failed, 1);
        assert!(matches!(h.ctx.queue.lease_next(), Lease::Empty));
        assert_eq!(h.notifications.recv().await, Some(campaign_id));
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_goes_terminal_failed() {
        let mut h = harness();
        let (campaign_id, job_ids) = seed(&h, &["flaky@x.io"], 10).await;
        for _ in 0..3 {
            h.mailer.script_outcome(
                "flaky@x.io",
                Err(MailerError::Transient("421 busy".to_string())),
            );
        }

        for _ in 0..3 {
            // Walk the clock past whatever backoff is pending.
            h.clock.advance(Duration::from_secs(60));
            let leased = lease(&h);
            process_one(&h.ctx, &leased).await.unwrap();
        }

        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.attempts, 3);
        assert_eq!(h.mailer.send_count("flaky@x.io"), 3);
        assert_eq!(h.notifications.recv().await, Some(campaign_id));
    }

    #[tokio::test]
    async fn rate_denial_defers_to_next_bucket() {
        let mut h = harness();
        let (_campaign_id, job_ids) = seed(&h, &["a@x.io", "b@x.io", "c@x.io"], 2).await;

        for _ in 0..3 {
            let leased = lease(&h);
            process_one(&h.ctx, &leased).await.unwrap();
        }

        // Two sends in this hour, the third deferred.
        let sent: Vec<_> = job_ids
            .iter()
            .filter(|id| h.store.job(**id).unwrap().status == "sent")
            .collect();
        let pending: Vec<_> = job_ids
            .iter()
            .filter(|id| h.store.job(**id).unwrap().status == "pending")
            .collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(pending.len(), 1);

        let next_bucket = rate_limiter::next_bucket_start(h.clock.now());
        match h.ctx.queue.lease_next() {
            Lease::WaitUntil(t) => assert_eq!(t, next_bucket),
            other => panic!("expected WaitUntil, got {:?}", other),
        }

        // The deferred job's lease is released in the store.
        assert_eq!(h.store.job(*pending[0]).unwrap().lease_until, None);

        // Once the next bucket opens, it goes out.
        h.clock.set(next_bucket);
        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();
        assert_eq!(h.store.job(*pending[0]).unwrap().status, "sent");
    }

    #[tokio::test]
    async fn already_terminal_job_is_not_resent() {
        let mut h = harness();
        let (_campaign_id, job_ids) = seed(&h, &["a@x.io"], 10).await;

        // Another worker already reported this job sent.
        h.store
            .update_job(
                job_ids[0],
                JobPatch::sent(h.clock.now(), 1),
                JobStatus::Pending,
            )
            .await
            .unwrap();

        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        assert_eq!(h.mailer.send_count("a@x.io"), 0);
        assert_eq!(h.ctx.queue.stats().completed, 1);
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistent_store_failure_halts_the_worker() {
        let h = harness();
        let (_campaign_id, _job_ids) = seed(&h, &["a@x.io"], 10).await;

        let leased = lease(&h);
        // Enough consecutive failures to exhaust every bounded retry.
        h.store.fail_next_writes(16);
        assert!(process_one(&h.ctx, &leased).await.is_err());
        assert_eq!(h.mailer.send_count("a@x.io"), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_job_pending_with_no_attempt() {
        let mut h = harness();
        let (_campaign_id, job_ids) = seed(&h, &["a@x.io"], 1).await;
        h.ctx
            .limiter
            .increment(&h.ctx.settings.sender)
            .await
            .unwrap();

        let leased = lease(&h);
        process_one(&h.ctx, &leased).await.unwrap();

        // A deferral is not an attempt: nothing was sent, nothing counted.
        let job = h.store.job(job_ids[0]).unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.attempts, 0);
        assert_eq!(h.mailer.send_count("a@x.io"), 0);
        assert!(h.notifications.try_recv().is_err());
    }
}
