//! store/mod.rs
//! Contrato de persistencia que consume el motor: campañas, contactos, ledger y sesiones.

pub mod memory_store;
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    errors::Result,
    models::{
        campaign_model::{Campaign, CampaignStatus, NewCampaign},
        delivery_model::DeliveryRecord,
        recipient_model::{NewRecipient, Recipient},
        session_model::SessionRecord,
    },
};

pub use memory_store::InMemoryStore;
pub use sqlite_store::SqliteStore;

/// Toda transición que sale de `pending` o `sending` es un UPDATE condicional:
/// los métodos que devuelven `bool` informan si la fila cambió.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create_campaign(&self, req: &NewCampaign) -> Result<Campaign>;
    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;
    async fn get_campaign_status(&self, id: &str) -> Result<Option<CampaignStatus>>;
    /// Más recientes primero.
    async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>>;
    /// `pending` con `scheduled_time <= now`.
    async fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;
    /// `sending` cuyo heartbeat es anterior a `heartbeat_before`.
    async fn get_stale_campaigns(&self, heartbeat_before: DateTime<Utc>) -> Result<Vec<Campaign>>;

    /// Compare-and-set hacia `sending` si el estado actual está en `expected`.
    /// Los estados terminales de `expected` se ignoran: nunca vuelven a `sending`.
    async fn claim_campaign(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Compare-and-set sobre una campaña `sending` con el heartbeat exacto observado.
    async fn reclaim_stale_campaign(
        &self,
        id: &str,
        expected_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn touch_campaign(&self, id: &str, now: DateTime<Utc>) -> Result<()>;
    /// `draft`/`pending` -> `pending` con la nueva hora.
    async fn schedule_campaign(&self, id: &str, scheduled_time: DateTime<Utc>) -> Result<bool>;
    /// `pending`/`sending` -> `cancelled`.
    async fn cancel_campaign(&self, id: &str) -> Result<bool>;
    /// Estado terminal, solo si la campaña sigue en `sending`.
    async fn update_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    async fn add_recipient(&self, req: &NewRecipient) -> Result<Recipient>;
    /// Orden estable (id ascendente).
    async fn list_recipients(
        &self,
        tenant_id: &str,
        group_filter: Option<&str>,
    ) -> Result<Vec<Recipient>>;

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> Result<()>;
    /// En orden de inserción.
    async fn list_delivery_records(&self, campaign_id: &str) -> Result<Vec<DeliveryRecord>>;
    /// Filas `sent` + `failed` del tenant desde `since`.
    async fn count_attempts_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u32>;

    async fn get_session(&self, tenant_id: &str) -> Result<Option<SessionRecord>>;
    async fn save_session(&self, record: &SessionRecord) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;
}
