use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::campaign::Campaign;
use crate::models::job::{Job, JobPatch, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("campaign already exists")]
    AlreadyExists,
    #[error("row not found")]
    NotFound,
    #[error("status changed concurrently")]
    CasMismatch,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 23505 = unique_violation
            if db.code().as_deref() == Some("23505") {
                return StoreError::AlreadyExists;
            }
        }
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable ground truth for campaigns and jobs. The queue and the rate
/// limiter both recover from here; workers treat writes as must-succeed.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic insert of a campaign and all its jobs: both appear or neither
    /// does. Returns `AlreadyExists` on a duplicate campaign id.
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError>;

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    async fn read_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// All pending jobs, optionally bounded by scheduled time, ordered by
    /// `(scheduled_time, id)`. Boot recovery and the reconciler sweep use
    /// this.
    async fn load_pending_jobs(
        &self,
        before_or_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Conditional update: applies `patch` only while the job's status is
    /// `expected_status`. `CasMismatch` means a concurrent transition won.
    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected_status: JobStatus,
    ) -> Result<(), StoreError>;

    /// Re-derives `(sent_count, failed_count, status)` from the job rows of
    /// a campaign. Single writer per campaign (the aggregator).
    async fn recompute_campaign(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError>;

    async fn list_jobs_by_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError>;

    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError>;

    /// Mirror of the KV rate counter, used only to reseed after eviction.
    async fn upsert_rate_counter(
        &self,
        hour: &str,
        sender: &str,
        count: i64,
    ) -> Result<(), StoreError>;

    async fn read_rate_counter(&self, hour: &str, sender: &str)
        -> Result<Option<i64>, StoreError>;
}

pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query(
            r#"
            INSERT INTO campaigns
                (id, owner, subject, body, attachments, start_time, delay_ms, hourly_limit,
                 total_count, sent_count, failed_count, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, $10, $11, $11)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.owner)
        .bind(&campaign.subject)
        .bind(&campaign.body)
        .bind(&campaign.attachments)
        .bind(campaign.start_time)
        .bind(campaign.delay_ms)
        .bind(campaign.hourly_limit)
        .bind(campaign.total_count)
        .bind(&campaign.status)
        .bind(campaign.created_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs
                    (id, campaign_id, owner, recipient, scheduled_time, status, attempts,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $7)
                "#,
            )
            .bind(job.id)
            .bind(job.campaign_id)
            .bind(&job.owner)
            .bind(&job.recipient)
            .bind(job.scheduled_time)
            .bind(&job.status)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(campaign)
    }

    async fn read_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(job)
    }

    async fn load_pending_jobs(
        &self,
        before_or_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = match before_or_at {
            Some(bound) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM jobs
                    WHERE status = 'pending' AND scheduled_time <= $1
                    ORDER BY scheduled_time ASC, id ASC
                    "#,
                )
                .bind(bound)
                .fetch_all(self.pool.as_ref())
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM jobs
                    WHERE status = 'pending'
                    ORDER BY scheduled_time ASC, id ASC
                    "#,
                )
                .fetch_all(self.pool.as_ref())
                .await?
            }
        };
        Ok(jobs)
    }

    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected_status: JobStatus,
    ) -> Result<(), StoreError> {
        let mut sets = vec!["updated_at = NOW()".to_string()];
        let mut idx: usize = 0;

        if patch.status.is_some() {
            idx += 1;
            sets.push(format!("status = ${}", idx));
        }
        if patch.attempts.is_some() {
            idx += 1;
            sets.push(format!("attempts = ${}", idx));
        }
        if patch.last_error.is_some() {
            idx += 1;
            sets.push(format!("last_error = ${}", idx));
        }
        if patch.sent_time.is_some() {
            idx += 1;
            sets.push(format!("sent_time = ${}", idx));
        }
        if patch.lease_until.is_some() {
            idx += 1;
            sets.push(format!("lease_until = ${}", idx));
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE id = ${} AND status = ${}",
            sets.join(", "),
            idx + 1,
            idx + 2
        );

        let mut query = sqlx::query(&sql);
        if let Some(status) = patch.status {
            query = query.bind(status.as_str());
        }
        if let Some(attempts) = patch.attempts {
            query = query.bind(attempts);
        }
        if let Some(last_error) = patch.last_error {
            query = query.bind(last_error);
        }
        if let Some(sent_time) = patch.sent_time {
            query = query.bind(sent_time);
        }
        if let Some(lease_until) = patch.lease_until {
            query = query.bind(lease_until);
        }

        let result = query
            .bind(id)
            .bind(expected_status.as_str())
            .execute(self.pool.as_ref())
            .await
            .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return match self.read_job(id).await? {
                Some(_) => Err(StoreError::CasMismatch),
                None => Err(StoreError::NotFound),
            };
        }
        Ok(())
    }

    async fn recompute_campaign(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns c
            SET sent_count = s.sent,
                failed_count = s.failed,
                status = CASE
                    WHEN s.sent + s.failed >= c.total_count THEN 'completed'
                    WHEN s.sent + s.failed > 0 THEN 'in-progress'
                    ELSE c.status
                END,
                updated_at = NOW()
            FROM (
                SELECT
                    COUNT(*) FILTER (WHERE status = 'sent')::INT AS sent,
                    COUNT(*) FILTER (WHERE status = 'failed')::INT AS failed
                FROM jobs
                WHERE campaign_id = $1
            ) s
            WHERE c.id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.as_ref())
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE owner = $1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(campaigns)
    }

    async fn list_jobs_by_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE campaign_id = $1 ORDER BY scheduled_time ASC, id ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(jobs)
    }

    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE owner = $1 AND status IN ('sent', 'failed')
            ORDER BY updated_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(jobs)
    }

    async fn upsert_rate_counter(
        &self,
        hour: &str,
        sender: &str,
        count: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rate_counters (hour, sender, count, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (hour, sender)
            DO UPDATE SET count = GREATEST(rate_counters.count, EXCLUDED.count), updated_at = NOW()
            "#,
        )
        .bind(hour)
        .bind(sender)
        .bind(count)
        .execute(self.pool.as_ref())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn read_rate_counter(
        &self,
        hour: &str,
        sender: &str,
    ) -> Result<Option<i64>, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM rate_counters WHERE hour = $1 AND sender = $2",
        )
        .bind(hour)
        .bind(sender)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(count)
    }
}
