use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;

use crate::channels::http_adapter::HttpChannelFactory;
use crate::config::AppConfig;
use crate::logger::init_logger;
use crate::services::campaign_service::CampaignService;
use crate::services::dispatch_service::DispatchCoordinator;
use crate::services::ledger_service::DeliveryLedger;
use crate::services::scheduler_service::SchedulerLoop;
use crate::services::sender_service::RateLimitedSender;
use crate::services::session_service::SessionManager;
use crate::store::{CampaignStore, SqliteStore};

mod app;
mod channels;
mod config;
mod errors;
mod handlers;
mod logger;
mod models;
mod services;
mod store;

#[cfg(test)]
mod tests;

const DB_MAX_CONNECTIONS: u32 = 5;

async fn setup_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CampaignStore>> {
    // Carpeta "data" para el archivo SQLite por defecto
    std::fs::create_dir_all("data").context("No se pudo crear directorio 'data'")?;

    log::info!("Conectando a SQLite en {}", config.database_url);
    let store = SqliteStore::connect(&config.database_url, DB_MAX_CONNECTIONS)
        .await
        .context("No se pudo abrir la base de datos / correr migraciones")?;
    Ok(Arc::new(store))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok(); // Cargar .env al inicio
    init_logger();

    let config = AppConfig::from_env();
    let store = setup_store(&config).await?;

    // Sesiones de canal: bomba de eventos + recuperación escalonada
    let factory = Arc::new(HttpChannelFactory::new(config.channel.clone()));
    let sessions = SessionManager::new(store.clone(), factory, config.session.clone());
    sessions.start();
    sessions
        .recover_sessions()
        .await
        .context("No se pudieron leer las sesiones persistidas")?;

    let ledger = DeliveryLedger::new(store.clone());
    let sender = Arc::new(RateLimitedSender::new(
        config.sender.clone(),
        store.clone(),
        ledger.clone(),
        sessions.clone(),
    ));
    let coordinator = Arc::new(DispatchCoordinator::new(
        store.clone(),
        sessions.clone(),
        sender,
    ));

    Arc::new(SchedulerLoop::new(
        store.clone(),
        coordinator.clone(),
        config.scheduler.clone(),
    ))
    .start();

    let campaign_service = CampaignService::new(
        store.clone(),
        coordinator,
        ledger,
        config.sender.default_country_code.clone(),
    );

    // Levantar servidor
    log::info!("Levantando servidor en {}:{}", config.http_bind, config.http_port);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(campaign_service.clone()))
            .app_data(web::Data::new(sessions.clone()))
            .configure(app::init_app)
    })
    .workers(1)
    .bind((config.http_bind.clone(), config.http_port))?
    .run()
    .await?;

    Ok(())
}
