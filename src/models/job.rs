use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub owner: String,
    pub recipient: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub sent_time: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => JobStatus::Sent,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Partial update applied through `Store::update_job`. Status transitions
/// carry a CAS predicate on the current status so a late duplicate worker
/// cannot double-transition a job.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub last_error: Option<String>,
    pub sent_time: Option<DateTime<Utc>>,
    /// `Some(None)` clears the lease.
    pub lease_until: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub fn lease(until: DateTime<Utc>) -> Self {
        Self {
            lease_until: Some(Some(until)),
            ..Default::default()
        }
    }

    pub fn clear_lease() -> Self {
        Self {
            lease_until: Some(None),
            ..Default::default()
        }
    }

    pub fn sent(at: DateTime<Utc>, attempts: i32) -> Self {
        Self {
            status: Some(JobStatus::Sent),
            attempts: Some(attempts),
            sent_time: Some(at),
            lease_until: Some(None),
            ..Default::default()
        }
    }

    pub fn failed(error: String, attempts: i32) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            attempts: Some(attempts),
            last_error: Some(error),
            lease_until: Some(None),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient: String,
    pub status: String,
    pub attempts: i32,
    pub scheduled_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobView {
    fn from(j: &Job) -> Self {
        Self {
            id: j.id,
            campaign_id: j.campaign_id,
            recipient: j.recipient.clone(),
            status: j.status.clone(),
            attempts: j.attempts,
            scheduled_time: j.scheduled_time,
            sent_time: j.sent_time,
            last_error: j.last_error.clone(),
        }
    }
}
