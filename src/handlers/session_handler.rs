//! handlers/session_handler.rs
use std::sync::Arc;

use actix_web::{web, HttpResponse};

use crate::handlers::error_response;
use crate::models::session_model::{LinkRequest, LinkResponse};
use crate::services::session_service::SessionManager;

/// POST /api/sessions/{tenant}/link
/// Nunca espera al canal: `pending` significa "consultar de nuevo".
pub async fn request_link_endpoint(
    sessions: web::Data<Arc<SessionManager>>,
    path: web::Path<String>,
    body: Option<web::Json<LinkRequest>>,
) -> HttpResponse {
    let tenant_id = path.into_inner();
    let phone_number = body.and_then(|b| b.into_inner().phone_number);

    match sessions
        .request_link_challenge(&tenant_id, phone_number)
        .await
    {
        Ok(resp @ LinkResponse::Pending) => HttpResponse::Accepted().json(resp),
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => error_response(&e),
    }
}

/// GET /api/sessions/{tenant}
pub async fn session_status_endpoint(
    sessions: web::Data<Arc<SessionManager>>,
    path: web::Path<String>,
) -> HttpResponse {
    let tenant_id = path.into_inner();

    match sessions.get_status(&tenant_id).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(&e),
    }
}

/// POST /api/sessions/{tenant}/logout
pub async fn logout_endpoint(
    sessions: web::Data<Arc<SessionManager>>,
    path: web::Path<String>,
) -> HttpResponse {
    let tenant_id = path.into_inner();

    match sessions.logout(&tenant_id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "disconnected" })),
        Err(e) => error_response(&e),
    }
}

/// POST /api/sessions/{tenant}/reset
pub async fn reset_endpoint(
    sessions: web::Data<Arc<SessionManager>>,
    path: web::Path<String>,
) -> HttpResponse {
    let tenant_id = path.into_inner();

    match sessions.reset(&tenant_id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "uninitialized" })),
        Err(e) => error_response(&e),
    }
}
