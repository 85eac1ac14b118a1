use std::collections::HashSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::models::campaign::{Attachment, Campaign, CampaignStatus, ScheduleEmailRequest};
use crate::models::job::{Job, JobStatus};
use crate::services::clock::Clock;
use crate::services::queue::DelayQueue;
use crate::services::store::{Store, StoreError};

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(StoreError),
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub campaign_id: Uuid,
    pub total_emails: i32,
    pub status: String,
    pub created_jobs: usize,
}

/// Accepts campaigns and fans them out into per-recipient jobs with
/// staggered due-times. Records intent only; sending is the worker pool's
/// business. The Store commit comes first: if anything goes wrong between
/// commit and enqueue, the reconciler sweep picks the jobs up later.
pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<DelayQueue>,
    clock: Arc<dyn Clock>,
    default_hourly_limit: i32,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DelayQueue>,
        clock: Arc<dyn Clock>,
        default_hourly_limit: i32,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            default_hourly_limit,
        }
    }

    pub async fn submit(
        &self,
        owner: &str,
        req: &ScheduleEmailRequest,
    ) -> Result<SubmitReceipt, SubmitError> {
        req.validate()
            .map_err(|e| SubmitError::Validation(e.to_string()))?;

        let start_time = DateTime::parse_from_rfc3339(&req.start_time)
            .map_err(|e| SubmitError::Validation(format!("invalid startTime: {}", e)))?
            .with_timezone(&Utc);

        if req.delay_ms < 0 {
            return Err(SubmitError::Validation(
                "delayMs must be non-negative".to_string(),
            ));
        }

        let hourly_limit = req.hourly_limit.unwrap_or(self.default_hourly_limit);
        if hourly_limit < 1 {
            return Err(SubmitError::Validation(
                "hourlyLimit must be positive".to_string(),
            ));
        }

        let recipients = normalize_recipients(&req.recipients)?;
        let attachments = validate_attachments(req)?;

        let campaign_id = req.campaign_id.unwrap_or_else(Uuid::new_v4);
        let created_at = self.clock.now();

        let campaign = Campaign {
            id: campaign_id,
            owner: owner.to_string(),
            subject: req.subject.clone(),
            body: req.body.clone(),
            attachments: sqlx::types::Json(attachments),
            start_time,
            delay_ms: req.delay_ms,
            hourly_limit,
            total_count: recipients.len() as i32,
            sent_count: 0,
            failed_count: 0,
            status: CampaignStatus::Scheduled.as_str().to_string(),
            created_at,
            updated_at: created_at,
        };

        let jobs: Vec<Job> = recipients
            .iter()
            .enumerate()
            .map(|(i, recipient)| Job {
                id: job_id(campaign_id, recipient, created_at),
                campaign_id,
                owner: owner.to_string(),
                recipient: recipient.clone(),
                scheduled_time: start_time
                    + chrono::Duration::milliseconds(i as i64 * req.delay_ms),
                status: JobStatus::Pending.as_str().to_string(),
                attempts: 0,
                last_error: None,
                sent_time: None,
                lease_until: None,
                created_at,
                updated_at: created_at,
            })
            .collect();

        match self.store.create_campaign_with_jobs(&campaign, &jobs).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                // Duplicate submission: hand back the original.
                let existing = self
                    .store
                    .read_campaign(campaign_id)
                    .await
                    .map_err(SubmitError::Store)?
                    .ok_or(SubmitError::Store(StoreError::NotFound))?;
                return Ok(SubmitReceipt {
                    campaign_id,
                    total_emails: existing.total_count,
                    status: existing.status,
                    created_jobs: 0,
                });
            }
            Err(e) => return Err(SubmitError::Store(e)),
        }

        for job in &jobs {
            self.queue
                .enqueue(job.id, campaign_id, job.scheduled_time, 0);
        }

        info!(
            campaign_id = %campaign_id,
            owner,
            recipients = jobs.len(),
            start_time = %start_time,
            "campaign scheduled"
        );

        Ok(SubmitReceipt {
            campaign_id,
            total_emails: campaign.total_count,
            status: campaign.status,
            created_jobs: jobs.len(),
        })
    }
}

/// Stable per-recipient id: replaying the same fan-out collides instead of
/// duplicating jobs.
fn job_id(campaign_id: Uuid, recipient: &str, created_at: DateTime<Utc>) -> Uuid {
    let name = format!("{}|{}", recipient, created_at.timestamp_millis());
    Uuid::new_v5(&campaign_id, name.as_bytes())
}

/// Trim, reject anything outside the canonical pattern, and deduplicate by
/// lowercase while preserving first-occurrence order.
fn normalize_recipients(raw: &[String]) -> Result<Vec<String>, SubmitError> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for entry in raw {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !EMAIL_PATTERN.is_match(trimmed) {
            return Err(SubmitError::Validation(format!(
                "invalid recipient: {}",
                trimmed
            )));
        }
        if seen.insert(trimmed.to_lowercase()) {
            recipients.push(trimmed.to_string());
        }
    }
    if recipients.is_empty() {
        return Err(SubmitError::Validation(
            "at least one recipient is required".to_string(),
        ));
    }
    Ok(recipients)
}

fn validate_attachments(req: &ScheduleEmailRequest) -> Result<Vec<Attachment>, SubmitError> {
    req.attachments
        .iter()
        .map(|a| {
            if a.filename.trim().is_empty() {
                return Err(SubmitError::Validation(
                    "attachment filename is required".to_string(),
                ));
            }
            BASE64.decode(&a.data).map_err(|_| {
                SubmitError::Validation(format!("attachment {} is not valid base64", a.filename))
            })?;
            Ok(Attachment {
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
                data: a.data.clone(),
            })
        })
        .collect()
}
