//! handlers/campaign_handler.rs
use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::handlers::error_response;
use crate::models::campaign_model::{ListCampaignsQuery, NewCampaign, ScheduleCampaignRequest};
use crate::services::campaign_service::CampaignService;

#[derive(Deserialize)]
pub struct LinksQuery {
    format: Option<String>,
}

/// POST /api/campaigns
pub async fn create_campaign_endpoint(
    campaign_service: web::Data<CampaignService>,
    body: web::Json<NewCampaign>,
) -> HttpResponse {
    match campaign_service.create_campaign(body.into_inner()).await {
        Ok(campaign) => HttpResponse::Created().json(campaign),
        Err(e) => error_response(&e),
    }
}

/// GET /api/campaigns?tenant_id=...
pub async fn list_campaigns_endpoint(
    campaign_service: web::Data<CampaignService>,
    query: web::Query<ListCampaignsQuery>,
) -> HttpResponse {
    match campaign_service.list_campaigns(&query.tenant_id).await {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => error_response(&e),
    }
}

/// GET /api/campaigns/{id}
pub async fn campaign_status_endpoint(
    campaign_service: web::Data<CampaignService>,
    path: web::Path<String>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    match campaign_service.get_campaign_status(&campaign_id).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(&e),
    }
}

/// POST /api/campaigns/{id}/send
pub async fn send_campaign_endpoint(
    campaign_service: web::Data<CampaignService>,
    path: web::Path<String>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    match campaign_service.trigger_immediate(&campaign_id).await {
        Ok(campaign) => HttpResponse::Accepted().json(campaign),
        Err(e) => error_response(&e),
    }
}

/// POST /api/campaigns/{id}/schedule
pub async fn schedule_campaign_endpoint(
    campaign_service: web::Data<CampaignService>,
    path: web::Path<String>,
    body: web::Json<ScheduleCampaignRequest>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    match campaign_service
        .schedule_campaign(&campaign_id, body.scheduled_time)
        .await
    {
        Ok(campaign) => HttpResponse::Ok().json(campaign),
        Err(e) => error_response(&e),
    }
}

/// POST /api/campaigns/{id}/cancel
pub async fn cancel_campaign_endpoint(
    campaign_service: web::Data<CampaignService>,
    path: web::Path<String>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    match campaign_service.cancel_schedule(&campaign_id).await {
        Ok(campaign) => HttpResponse::Ok().json(campaign),
        Err(e) => error_response(&e),
    }
}

/// GET /api/campaigns/{id}/links[?format=csv]
pub async fn chat_links_endpoint(
    campaign_service: web::Data<CampaignService>,
    path: web::Path<String>,
    query: web::Query<LinksQuery>,
) -> HttpResponse {
    let campaign_id = path.into_inner();

    if query.format.as_deref() == Some("csv") {
        return match campaign_service.chat_links_csv(&campaign_id).await {
            Ok(csv) => HttpResponse::Ok()
                .content_type("text/csv; charset=utf-8")
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"campaign_{campaign_id}_links.csv\""),
                ))
                .body(csv),
            Err(e) => error_response(&e),
        };
    }

    match campaign_service.chat_links(&campaign_id).await {
        Ok(links) => HttpResponse::Ok().json(links),
        Err(e) => error_response(&e),
    }
}
