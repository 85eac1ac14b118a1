use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::campaign::{Campaign, ScheduleEmailRequest};
use crate::models::job::Job;
use crate::services::aggregator;
use crate::services::clock::Clock;
use crate::services::kv::Kv;
use crate::services::mailer::Mailer;
use crate::services::queue::{DelayQueue, QueueStats, RetryPolicy};
use crate::services::rate_limiter::RateLimiter;
use crate::services::scheduler::{Scheduler, SubmitError, SubmitReceipt};
use crate::services::store::{Store, StoreError};
use crate::services::worker::{spawn_workers, WorkerContext, WorkerSettings};

#[derive(Clone)]
pub struct CoreOptions {
    /// Envelope-from identity; the hourly budget is counted against it.
    pub sender: String,
    /// Applied when a campaign omits `hourlyLimit`.
    pub default_hourly_limit: i32,
    /// Post-send pacing floor per worker.
    pub pacing_floor: Duration,
    pub worker_concurrency: usize,
    pub lease_duration: Duration,
    pub retry_policy: RetryPolicy,
    /// Aggregator coalescing window.
    pub aggregate_window: Duration,
    /// Cadence of the sweep that re-enqueues store-committed jobs the queue
    /// missed.
    pub reconcile_interval: Duration,
    /// Deferral applied when the KV counter store is unreachable.
    pub kv_retry_delay: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            sender: "noreply@reachinbox.app".to_string(),
            default_hourly_limit: 200,
            pacing_floor: Duration::from_millis(2000),
            worker_concurrency: 5,
            lease_duration: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            aggregate_window: Duration::from_millis(250),
            reconcile_interval: Duration::from_secs(60),
            kv_retry_delay: Duration::from_secs(30),
        }
    }
}

/// The assembled scheduling core. All side-effecting collaborators come in
/// as capabilities, so tests run the same wiring against fakes.
pub struct Core {
    store: Arc<dyn Store>,
    queue: Arc<DelayQueue>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    worker_ctx: Mutex<Option<Arc<WorkerContext>>>,
    healthy: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    runtime_tasks: Mutex<Vec<JoinHandle<()>>>,
    aggregator_task: Mutex<Option<JoinHandle<()>>>,
    options: CoreOptions,
}

impl Core {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        options: CoreOptions,
    ) -> Self {
        let queue = Arc::new(DelayQueue::new(
            clock.clone(),
            options.retry_policy.clone(),
            options.lease_duration,
        ));
        let limiter = Arc::new(RateLimiter::new(kv, store.clone(), clock.clone()));
        let (aggregator, aggregator_task) =
            aggregator::spawn(store.clone(), clock.clone(), options.aggregate_window);
        let healthy = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            options.default_hourly_limit,
        );

        let worker_ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            limiter,
            mailer,
            clock: clock.clone(),
            aggregator,
            healthy: healthy.clone(),
            settings: WorkerSettings {
                sender: options.sender.clone(),
                pacing_floor: options.pacing_floor,
                kv_retry_delay: options.kv_retry_delay,
            },
        });

        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            queue,
            clock,
            scheduler,
            worker_ctx: Mutex::new(Some(worker_ctx)),
            healthy,
            shutdown,
            runtime_tasks: Mutex::new(Vec::new()),
            aggregator_task: Mutex::new(Some(aggregator_task)),
            options,
        }
    }

    /// Rebuild queue state from the Store, then start the worker pool and
    /// the reconciler sweep.
    pub async fn start(&self) -> Result<(), StoreError> {
        let recovered = self.queue.recover_from_store(self.store.as_ref()).await?;
        info!(recovered, "queue recovered from store");

        let ctx = self
            .worker_ctx
            .lock()
            .unwrap()
            .clone()
            .expect("core already shut down");
        let shutdown_rx = self.shutdown.subscribe();

        let mut tasks = self.runtime_tasks.lock().unwrap();
        tasks.extend(spawn_workers(
            ctx,
            self.options.worker_concurrency,
            shutdown_rx.clone(),
        ));
        tasks.push(self.spawn_reconciler(shutdown_rx));
        Ok(())
    }

    fn spawn_reconciler(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let clock = self.clock.clone();
        let interval = self.options.reconcile_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = clock.sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                match queue.recover_from_store(store.as_ref()).await {
                    Ok(0) => {}
                    Ok(n) => info!(enqueued = n, "reconciler picked up unqueued jobs"),
                    Err(e) => warn!(error = %e, "reconciler sweep failed"),
                }
            }
        })
    }

    pub async fn submit(
        &self,
        owner: &str,
        req: &ScheduleEmailRequest,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.scheduler.submit(owner, req).await
    }

    pub async fn get_campaign(
        &self,
        owner: &str,
        id: Uuid,
    ) -> Result<Option<(Campaign, Vec<Job>)>, StoreError> {
        let Some(campaign) = self.store.read_campaign(id).await? else {
            return Ok(None);
        };
        if campaign.owner != owner {
            return Ok(None);
        }
        let jobs = self.store.list_jobs_by_campaign(id).await?;
        Ok(Some((campaign, jobs)))
    }

    pub async fn list_campaigns(&self, owner: &str) -> Result<Vec<Campaign>, StoreError> {
        self.store.list_campaigns_by_owner(owner).await
    }

    pub async fn list_terminal_jobs(&self, owner: &str) -> Result<Vec<Job>, StoreError> {
        self.store.list_terminal_jobs_by_owner(owner).await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// False once a worker has given up on the Store; the façade turns this
    /// into 503s.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Stop leasing, let in-flight sends finish, flush the aggregator.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = self.runtime_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Dropping the last worker context releases the final aggregator
        // handle; the aggregator drains its channel and exits.
        self.worker_ctx.lock().unwrap().take();
        let aggregator_task = self.aggregator_task.lock().unwrap().take();
        if let Some(task) = aggregator_task {
            let _ = task.await;
        }
        info!("core shut down");
    }
}
