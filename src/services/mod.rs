//! services/mod.rs
//! Módulo que agrupa distintos "servicios" o "capas de negocio" de la app.

pub mod campaign_service;
pub mod dispatch_service;
pub mod ledger_service;
pub mod scheduler_service;
pub mod sender_service;
pub mod session_service;
pub mod template_service;
