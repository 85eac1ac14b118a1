//! In-memory capability fakes for the unit suites. Everything here is
//! injected through the same traits production uses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::campaign::{Attachment, Campaign, CampaignStatus};
use crate::models::job::{Job, JobPatch, JobStatus};
use crate::services::clock::Clock;
use crate::services::kv::{Kv, KvError};
use crate::services::mailer::{Mailer, MailerError, OutboundEmail};
use crate::services::store::{Store, StoreError};

pub fn campaign_fixture(owner: &str, start: DateTime<Utc>, total: i32) -> Campaign {
    Campaign {
        id: Uuid::new_v4(),
        owner: owner.to_string(),
        subject: "Hi".to_string(),
        body: "<p>Hi</p>".to_string(),
        attachments: sqlx::types::Json(Vec::<Attachment>::new()),
        start_time: start,
        delay_ms: 0,
        hourly_limit: 100,
        total_count: total,
        sent_count: 0,
        failed_count: 0,
        status: CampaignStatus::Scheduled.as_str().to_string(),
        created_at: start,
        updated_at: start,
    }
}

pub fn job_fixtures(campaign: &Campaign, recipients: &[&str]) -> Vec<Job> {
    recipients
        .iter()
        .enumerate()
        .map(|(i, recipient)| Job {
            id: Uuid::new_v5(&campaign.id, recipient.as_bytes()),
            campaign_id: campaign.id,
            owner: campaign.owner.clone(),
            recipient: recipient.to_string(),
            scheduled_time: campaign.start_time
                + chrono::Duration::milliseconds(i as i64 * campaign.delay_ms),
            status: JobStatus::Pending.as_str().to_string(),
            attempts: 0,
            last_error: None,
            sent_time: None,
            lease_until: None,
            created_at: campaign.created_at,
            updated_at: campaign.created_at,
        })
        .collect()
}

#[derive(Default)]
pub struct MemoryStore {
    campaigns: Mutex<HashMap<Uuid, Campaign>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
    counters: Mutex<HashMap<(String, String), i64>>,
    /// Remaining forced `Unavailable` failures, consumed one per write.
    fail_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_write_gate(&self) -> Result<(), StoreError> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError> {
        self.check_write_gate()?;
        let mut campaigns = self.campaigns.lock().unwrap();
        if campaigns.contains_key(&campaign.id) {
            return Err(StoreError::AlreadyExists);
        }
        campaigns.insert(campaign.id, campaign.clone());
        let mut stored = self.jobs.lock().unwrap();
        for job in jobs {
            stored.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        Ok(self.campaigns.lock().unwrap().get(&id).cloned())
    }

    async fn read_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn load_pending_jobs(
        &self,
        before_or_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status() == JobStatus::Pending)
            .filter(|j| before_or_at.map_or(true, |bound| j.scheduled_time <= bound))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(jobs)
    }

    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected_status: JobStatus,
    ) -> Result<(), StoreError> {
        self.check_write_gate()?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status() != expected_status {
            return Err(StoreError::CasMismatch);
        }
        if let Some(status) = patch.status {
            job.status = status.as_str().to_string();
        }
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(last_error) = patch.last_error {
            job.last_error = Some(last_error);
        }
        if let Some(sent_time) = patch.sent_time {
            job.sent_time = Some(sent_time);
        }
        if let Some(lease_until) = patch.lease_until {
            job.lease_until = lease_until;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn recompute_campaign(&self, id: Uuid) -> Result<(), StoreError> {
        self.check_write_gate()?;
        let (sent, failed) = {
            let jobs = self.jobs.lock().unwrap();
            let sent = jobs
                .values()
                .filter(|j| j.campaign_id == id && j.status() == JobStatus::Sent)
                .count() as i32;
            let failed = jobs
                .values()
                .filter(|j| j.campaign_id == id && j.status() == JobStatus::Failed)
                .count() as i32;
            (sent, failed)
        };
        let mut campaigns = self.campaigns.lock().unwrap();
        let campaign = campaigns.get_mut(&id).ok_or(StoreError::NotFound)?;
        campaign.sent_count = sent;
        campaign.failed_count = failed;
        campaign.status = if sent + failed >= campaign.total_count {
            CampaignStatus::Completed.as_str().to_string()
        } else if sent + failed > 0 {
            CampaignStatus::InProgress.as_str().to_string()
        } else {
            campaign.status.clone()
        };
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(campaigns)
    }

    async fn list_jobs_by_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.campaign_id == campaign_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(jobs)
    }

    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.owner == owner && j.status().is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.updated_at));
        Ok(jobs)
    }

    async fn upsert_rate_counter(
        &self,
        hour: &str,
        sender: &str,
        count: i64,
    ) -> Result<(), StoreError> {
        self.check_write_gate()?;
        let mut counters = self.counters.lock().unwrap();
        let slot = counters
            .entry((hour.to_string(), sender.to_string()))
            .or_insert(0);
        *slot = (*slot).max(count);
        Ok(())
    }

    async fn read_rate_counter(
        &self,
        hour: &str,
        sender: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .counters
            .lock()
            .unwrap()
            .get(&(hour.to_string(), sender.to_string()))
            .copied())
    }
}

pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    data: Mutex<HashMap<String, (i64, Option<DateTime<Utc>>)>>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate eviction, as Redis would do under memory pressure.
    pub fn evict(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    fn live_value(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some((_, Some(expiry))) if *expiry <= now => {
                data.remove(key);
                None
            }
            Some((value, _)) => Some(*value),
            None => None,
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, KvError> {
        Ok(self.live_value(key))
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), KvError> {
        let expiry = self.clock.now() + chrono::Duration::from_std(ttl).unwrap();
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, Some(expiry)));
        Ok(())
    }

    async fn incr(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError> {
        let current = self.live_value(key).unwrap_or(0);
        let next = current + 1;
        let mut data = self.data.lock().unwrap();
        if next == 1 {
            let expiry = self.clock.now() + chrono::Duration::from_std(ttl_on_create).unwrap();
            data.insert(key.to_string(), (next, Some(expiry)));
        } else {
            let expiry = data.get(key).and_then(|(_, e)| *e);
            data.insert(key.to_string(), (next, expiry));
        }
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

type ScriptedOutcome = Result<String, MailerError>;

pub struct FakeMailer {
    clock: Arc<dyn Clock>,
    script: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    sends: Mutex<Vec<(String, DateTime<Utc>)>>,
    counter: AtomicUsize,
}

impl FakeMailer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            script: Mutex::new(HashMap::new()),
            sends: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Queue an outcome for the next send to `recipient`; unscripted sends
    /// succeed.
    pub fn script_outcome(&self, recipient: &str, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .unwrap()
            .entry(recipient.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// `(recipient, instant)` for every send call, in order.
    pub fn sends(&self) -> Vec<(String, DateTime<Utc>)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self, recipient: &str) -> usize {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == recipient)
            .count()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError> {
        self.sends
            .lock()
            .unwrap()
            .push((email.to.clone(), self.clock.now()));
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&email.to)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("fake-message-{}", n))
            }
        }
    }
}
