use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use crate::core::Core;
use crate::middleware::auth::owner_id;
use crate::models::campaign::{CampaignView, ScheduleEmailRequest};
use crate::models::job::JobView;
use crate::services::scheduler::SubmitError;
use crate::services::store::StoreError;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/emails")
            .route("/schedule", web::post().to(schedule_emails))
            .route("/scheduled", web::get().to(list_scheduled))
            .route("/sent", web::get().to(list_sent))
            .route("/schedule/{id}", web::get().to(get_schedule))
            .route("/queue/status", web::get().to(queue_status)),
    );
}

async fn schedule_emails(
    core: web::Data<Core>,
    body: web::Json<ScheduleEmailRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let owner = owner_id(&req)?;

    if !core.is_healthy() {
        return Ok(HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({"error": "store unavailable"})));
    }

    match core.submit(&owner, &body).await {
        Ok(receipt) => Ok(HttpResponse::Created().json(serde_json::json!({
            "scheduleId": receipt.campaign_id,
            "totalEmails": receipt.total_emails,
            "status": receipt.status,
            "createdJobs": receipt.created_jobs,
        }))),
        Err(SubmitError::Validation(msg)) => {
            Ok(HttpResponse::BadRequest().json(serde_json::json!({"error": msg})))
        }
        Err(SubmitError::Store(e)) => Ok(store_error_response(e)),
    }
}

async fn list_scheduled(
    core: web::Data<Core>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let owner = owner_id(&req)?;
    match core.list_campaigns(&owner).await {
        Ok(campaigns) => {
            let views: Vec<CampaignView> = campaigns.iter().map(CampaignView::from).collect();
            Ok(HttpResponse::Ok().json(views))
        }
        Err(e) => Ok(store_error_response(e)),
    }
}

async fn list_sent(
    core: web::Data<Core>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let owner = owner_id(&req)?;
    match core.list_terminal_jobs(&owner).await {
        Ok(jobs) => {
            let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
            Ok(HttpResponse::Ok().json(views))
        }
        Err(e) => Ok(store_error_response(e)),
    }
}

async fn get_schedule(
    core: web::Data<Core>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let owner = owner_id(&req)?;
    let campaign_id = path.into_inner();

    match core.get_campaign(&owner, campaign_id).await {
        Ok(Some((campaign, jobs))) => {
            let jobs: Vec<JobView> = jobs.iter().map(JobView::from).collect();
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "campaign": CampaignView::from(&campaign),
                "jobs": jobs,
            })))
        }
        Ok(None) => Ok(HttpResponse::NotFound()
            .json(serde_json::json!({"error": "Campaign not found"}))),
        Err(e) => Ok(store_error_response(e)),
    }
}

async fn queue_status(
    core: web::Data<Core>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    owner_id(&req)?;
    Ok(HttpResponse::Ok().json(core.queue_stats()))
}

fn store_error_response(e: StoreError) -> HttpResponse {
    match e {
        StoreError::Unavailable(_) => HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({"error": "store unavailable"})),
        other => HttpResponse::InternalServerError()
            .json(serde_json::json!({"error": other.to_string()})),
    }
}
