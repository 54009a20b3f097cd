//! store/memory_store.rs
//! Store en memoria. Sin persistencia: para tests y para correr sin DB.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    errors::{Error, Result},
    models::{
        campaign_model::{Campaign, CampaignStatus, NewCampaign},
        delivery_model::{DeliveryRecord, DeliveryStatus},
        recipient_model::{NewRecipient, Recipient},
        session_model::SessionRecord,
        to_millis,
    },
    store::CampaignStore,
};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<String, Campaign>,
    recipients: Vec<Recipient>,
    deliveries: Vec<DeliveryRecord>,
    sessions: HashMap<String, SessionRecord>,
    next_recipient_id: i64,
}

/// Cuenta cada escritura y puede simular una caída del Store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Número de operaciones de escritura recibidas.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Mientras esté activo, todas las operaciones fallan como `Persistence`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn read(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Persistence(sqlx::Error::PoolTimedOut));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self) -> Result<MutexGuard<'_, Inner>> {
        let guard = self.read()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(guard)
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn create_campaign(&self, req: &NewCampaign) -> Result<Campaign> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id.clone(),
            name: req.name.clone().unwrap_or_else(|| "General".to_string()),
            message_template: req.message_template.clone(),
            media_url: req.media_url.clone(),
            group_filter: req.group_filter.clone(),
            status: if req.scheduled_time.is_some() {
                CampaignStatus::Pending
            } else {
                CampaignStatus::Draft
            },
            scheduled_time: req.scheduled_time,
            heartbeat_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner
            .campaigns
            .insert(campaign.id.clone(), campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.read()?.campaigns.get(id).cloned())
    }

    async fn get_campaign_status(&self, id: &str) -> Result<Option<CampaignStatus>> {
        Ok(self.read()?.campaigns.get(id).map(|c| c.status))
    }

    async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        let inner = self.read()?;
        let mut campaigns: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(campaigns)
    }

    async fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let inner = self.read()?;
        let mut due: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Pending
                    && c.scheduled_time.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn get_stale_campaigns(&self, heartbeat_before: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let inner = self.read()?;
        Ok(inner
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Sending
                    && c.heartbeat_at.is_some_and(|h| h < heartbeat_before)
            })
            .cloned()
            .collect())
    }

    async fn claim_campaign(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.campaigns.get_mut(id) {
            Some(c) if !c.status.is_terminal() && expected.contains(&c.status) => {
                c.status = CampaignStatus::Sending;
                c.heartbeat_at = Some(now);
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale_campaign(
        &self,
        id: &str,
        expected_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.campaigns.get_mut(id) {
            Some(c)
                if c.status == CampaignStatus::Sending
                    && c.heartbeat_at.map(to_millis) == Some(to_millis(expected_heartbeat)) =>
            {
                c.heartbeat_at = Some(now);
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_campaign(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(c) = inner.campaigns.get_mut(id) {
            if c.status == CampaignStatus::Sending {
                c.heartbeat_at = Some(now);
                c.updated_at = now;
            }
        }
        Ok(())
    }

    async fn schedule_campaign(&self, id: &str, scheduled_time: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.campaigns.get_mut(id) {
            Some(c) if matches!(c.status, CampaignStatus::Draft | CampaignStatus::Pending) => {
                c.status = CampaignStatus::Pending;
                c.scheduled_time = Some(scheduled_time);
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_campaign(&self, id: &str) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.campaigns.get_mut(id) {
            Some(c) if matches!(c.status, CampaignStatus::Pending | CampaignStatus::Sending) => {
                c.status = CampaignStatus::Cancelled;
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.campaigns.get_mut(id) {
            Some(c) if c.status == CampaignStatus::Sending => {
                c.status = status;
                c.error_message = error_message.map(str::to_string);
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_recipient(&self, req: &NewRecipient) -> Result<Recipient> {
        let mut inner = self.write()?;
        inner.next_recipient_id += 1;
        let recipient = Recipient {
            id: inner.next_recipient_id,
            tenant_id: req.tenant_id.clone(),
            display_name: req.display_name.clone(),
            address: req.address.clone(),
            group_tag: req.group_tag.clone(),
        };
        inner.recipients.push(recipient.clone());
        Ok(recipient)
    }

    async fn list_recipients(
        &self,
        tenant_id: &str,
        group_filter: Option<&str>,
    ) -> Result<Vec<Recipient>> {
        let inner = self.read()?;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| group_filter.is_none() || r.group_tag.as_deref() == group_filter)
            .cloned()
            .collect())
    }

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> Result<()> {
        self.write()?.deliveries.push(record.clone());
        Ok(())
    }

    async fn list_delivery_records(&self, campaign_id: &str) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .read()?
            .deliveries
            .iter()
            .filter(|d| d.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn count_attempts_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let count = self
            .read()?
            .deliveries
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.attempted_at >= since)
            .filter(|d| d.status != DeliveryStatus::Skipped)
            .count();
        Ok(count as u32)
    }

    async fn get_session(&self, tenant_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.read()?.sessions.get(tenant_id).cloned())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        self.write()?
            .sessions
            .insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> =
            self.read()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(sessions)
    }
}
