//! handlers/mod.rs
//! Módulo que agrupa los distintos handlers HTTP.

pub mod campaign_handler;
pub mod session_handler;

use actix_web::HttpResponse;

use crate::errors::Error;

/// Traduce la taxonomía de errores a códigos HTTP.
pub fn error_response(e: &Error) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        Error::Validation { .. } => HttpResponse::BadRequest().json(body),
        Error::NotFound { .. } => HttpResponse::NotFound().json(body),
        Error::ChannelUnavailable { .. } | Error::ClaimConflict { .. } => {
            HttpResponse::Conflict().json(body)
        }
        e if e.is_persistence() => {
            log::error!("(error_response) Store inaccesible: {}", e);
            HttpResponse::ServiceUnavailable().json(body)
        }
        _ => {
            log::error!("(error_response) {:?}", e);
            HttpResponse::InternalServerError().json(body)
        }
    }
}
