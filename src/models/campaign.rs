use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub owner: String,
    pub subject: String,
    pub body: String,
    pub attachments: sqlx::types::Json<Vec<Attachment>>,
    pub start_time: DateTime<Utc>,
    pub delay_ms: i64,
    pub hourly_limit: i32,
    pub total_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn status(&self) -> CampaignStatus {
        CampaignStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CampaignStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::InProgress => "in-progress",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => CampaignStatus::Completed,
            "in-progress" => CampaignStatus::InProgress,
            _ => CampaignStatus::Scheduled,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attachment payload as stored on the campaign row. `data` stays base64 in
/// JSONB; it is decoded when the outbound message is composed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEmailRequest {
    #[validate(length(min = 1, message = "subject is required"))]
    pub subject: String,
    #[validate(length(min = 1, message = "body is required"))]
    pub body: String,
    #[validate(length(min = 1, message = "at least one recipient is required"))]
    pub recipients: Vec<String>,
    /// ISO-8601 UTC instant of the first allowed attempt.
    pub start_time: String,
    #[serde(default)]
    pub delay_ms: i64,
    pub hourly_limit: Option<i32>,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
    /// Optional caller-supplied id; resubmitting the same id returns the
    /// original campaign instead of creating a second one.
    pub campaign_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInput {
    pub filename: String,
    pub content_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignView {
    pub id: Uuid,
    pub subject: String,
    pub status: String,
    pub total_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub start_time: DateTime<Utc>,
    pub delay_ms: i64,
    pub hourly_limit: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Campaign> for CampaignView {
    fn from(c: &Campaign) -> Self {
        Self {
            id: c.id,
            subject: c.subject.clone(),
            status: c.status.clone(),
            total_count: c.total_count,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
            start_time: c.start_time,
            delay_ms: c.delay_ms,
            hourly_limit: c.hourly_limit,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}
