//! app.rs
use crate::handlers::{campaign_handler, session_handler};
use actix_web::web;

pub fn init_app(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(
                web::scope("/campaigns")
                    .route(
                        "",
                        web::post().to(campaign_handler::create_campaign_endpoint),
                    )
                    .route("", web::get().to(campaign_handler::list_campaigns_endpoint))
                    .route(
                        "/{id}",
                        web::get().to(campaign_handler::campaign_status_endpoint),
                    )
                    .route(
                        "/{id}/send",
                        web::post().to(campaign_handler::send_campaign_endpoint),
                    )
                    .route(
                        "/{id}/schedule",
                        web::post().to(campaign_handler::schedule_campaign_endpoint),
                    )
                    .route(
                        "/{id}/cancel",
                        web::post().to(campaign_handler::cancel_campaign_endpoint),
                    )
                    .route(
                        "/{id}/links",
                        web::get().to(campaign_handler::chat_links_endpoint),
                    ),
            )
            .service(
                web::scope("/sessions")
                    .route(
                        "/{tenant}",
                        web::get().to(session_handler::session_status_endpoint),
                    )
                    .route(
                        "/{tenant}/link",
                        web::post().to(session_handler::request_link_endpoint),
                    )
                    .route(
                        "/{tenant}/logout",
                        web::post().to(session_handler::logout_endpoint),
                    )
                    .route(
                        "/{tenant}/reset",
                        web::post().to(session_handler::reset_endpoint),
                    ),
            ),
    );
}
