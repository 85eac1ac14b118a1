use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::clock::Clock;
use crate::services::store::Store;

/// Cheap, clonable notifier handed to workers. Dropping every handle ends
/// the aggregator task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl AggregatorHandle {
    pub fn notify(&self, campaign_id: Uuid) {
        // The task only dies at shutdown; a send failure then is harmless.
        let _ = self.tx.send(campaign_id);
    }

    #[cfg(test)]
    pub fn test_pair() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Recomputes campaign aggregates off a channel of job-transition
/// notifications. Notifications for the same campaign inside the coalescing
/// window collapse into one `recompute_campaign`, which keeps the campaign
/// row single-writer. All waiting goes through the injected clock.
pub fn spawn(
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    window: Duration,
) -> (AggregatorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();

    let task = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = HashSet::new();
            batch.insert(first);

            // Soak up everything else that lands within the window.
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(id) => {
                            batch.insert(id);
                        }
                        None => break,
                    },
                    _ = clock.sleep(window) => break,
                }
            }

            debug!(campaigns = batch.len(), "recomputing campaign aggregates");
            for id in batch {
                recompute(store.as_ref(), clock.as_ref(), id).await;
            }
        }
    });

    (AggregatorHandle { tx }, task)
}

async fn recompute(store: &dyn Store, clock: &dyn Clock, campaign_id: Uuid) {
    let mut delay = Duration::from_millis(200);
    for attempt in 0..3 {
        match store.recompute_campaign(campaign_id).await {
            Ok(()) => return,
            Err(e) if attempt == 2 => {
                // The next terminal transition for this campaign will
                // trigger another recompute; completion is still reached.
                warn!(campaign_id = %campaign_id, error = %e, "campaign recompute failed");
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "campaign recompute failed, retrying");
                clock.sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobPatch, JobStatus};
    use crate::services::clock::ManualClock;
    use crate::services::store::Store;
    use crate::services::test_support::{campaign_fixture, job_fixtures, MemoryStore};
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        ))
    }

    async fn seeded_store() -> (Arc<MemoryStore>, Uuid, Vec<Uuid>) {
        let store = Arc::new(MemoryStore::new());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let campaign = campaign_fixture("u1", start, 2);
        let jobs = job_fixtures(&campaign, &["a@x.io", "b@x.io"]);
        store.create_campaign_with_jobs(&campaign, &jobs).await.unwrap();
        (store.clone(), campaign.id, jobs.iter().map(|j| j.id).collect())
    }

    #[tokio::test]
    async fn first_terminal_job_moves_campaign_in_progress() {
        let (store, campaign_id, job_ids) = seeded_store().await;
        let clock = clock();
        store
            .update_job(
                job_ids[0],
                JobPatch::sent(clock.now(), 1),
                JobStatus::Pending,
            )
            .await
            .unwrap();

        let (handle, task) = spawn(store.clone(), clock, Duration::from_millis(250));
        handle.notify(campaign_id);
        drop(handle);
        task.await.unwrap();

        let campaign = store.campaign(campaign_id).unwrap();
        assert_eq!(campaign.status, "in-progress");
        assert_eq!(campaign.sent_count, 1);
        assert_eq!(campaign.failed_count, 0);
    }

    #[tokio::test]
    async fn all_terminal_jobs_complete_campaign() {
        let (store, campaign_id, job_ids) = seeded_store().await;
        let clock = clock();
        store
            .update_job(job_ids[0], JobPatch::sent(clock.now(), 1), JobStatus::Pending)
            .await
            .unwrap();
        store
            .update_job(
                job_ids[1],
                JobPatch::failed("hard bounce".to_string(), 1),
                JobStatus::Pending,
            )
            .await
            .unwrap();

        let (handle, task) = spawn(store.clone(), clock, Duration::from_millis(250));
        // A burst of notifications for one campaign collapses into a single
        // consistent recompute.
        handle.notify(campaign_id);
        handle.notify(campaign_id);
        handle.notify(campaign_id);
        drop(handle);
        task.await.unwrap();

        let campaign = store.campaign(campaign_id).unwrap();
        assert_eq!(campaign.status, "completed");
        assert_eq!(campaign.sent_count + campaign.failed_count, campaign.total_count);
    }

    #[tokio::test]
    async fn recompute_survives_transient_store_failure() {
        let (store, campaign_id, job_ids) = seeded_store().await;
        let clock = clock();
        store
            .update_job(job_ids[0], JobPatch::sent(clock.now(), 1), JobStatus::Pending)
            .await
            .unwrap();

        store.fail_next_writes(1);
        let (handle, task) = spawn(store.clone(), clock, Duration::from_millis(250));
        handle.notify(campaign_id);
        drop(handle);
        task.await.unwrap();

        assert_eq!(store.campaign(campaign_id).unwrap().status, "in-progress");
    }
}
