//! services/campaign_service.rs
//! Operaciones que exponen las campañas a los llamadores (HTTP).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    errors::{Error, Result},
    models::campaign_model::{
        Campaign, CampaignStatus, CampaignStatusResponse, ChatLink, NewCampaign,
    },
    services::{
        dispatch_service::DispatchCoordinator,
        ledger_service::DeliveryLedger,
        template_service,
    },
    store::CampaignStore,
};

/// Estados desde los que se permite un envío manual. Los terminales no vuelven a `sending`.
const TRIGGERABLE: [CampaignStatus; 1] = [CampaignStatus::Draft];

#[derive(Clone)]
pub struct CampaignService {
    store: Arc<dyn CampaignStore>,
    coordinator: Arc<DispatchCoordinator>,
    ledger: DeliveryLedger,
    default_country_code: String,
}

impl CampaignService {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        coordinator: Arc<DispatchCoordinator>,
        ledger: DeliveryLedger,
        default_country_code: String,
    ) -> Self {
        CampaignService {
            store,
            coordinator,
            ledger,
            default_country_code,
        }
    }

    pub async fn create_campaign(&self, req: NewCampaign) -> Result<Campaign> {
        if req.tenant_id.trim().is_empty() {
            return Err(Error::validation("tenant_id is required"));
        }
        if req.message_template.trim().is_empty() {
            return Err(Error::validation("message_template must not be blank"));
        }
        let req = NewCampaign {
            name: req
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            group_filter: req
                .group_filter
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
            ..req
        };
        let campaign = self.store.create_campaign(&req).await?;
        log::info!(
            "(create_campaign) campaign={} tenant={} status={}",
            campaign.id,
            campaign.tenant_id,
            campaign.status
        );
        Ok(campaign)
    }

    /// Envío inmediato. El dispatch corre en segundo plano, desacoplado del request.
    pub async fn trigger_immediate(&self, campaign_id: &str) -> Result<Campaign> {
        let campaign = self.load(campaign_id).await?;
        match campaign.status {
            CampaignStatus::Pending => {
                let at = campaign
                    .scheduled_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                return Err(Error::validation(format!(
                    "campaign is scheduled for {at}; cancel the schedule before sending now"
                )));
            }
            s if !TRIGGERABLE.contains(&s) => {
                return Err(Error::validation(format!("campaign is already {s}")));
            }
            _ => {}
        }

        if !self
            .store
            .claim_campaign(campaign_id, &TRIGGERABLE, Utc::now())
            .await?
        {
            return Err(Error::ClaimConflict {
                campaign_id: campaign_id.to_string(),
            });
        }
        log::info!("(trigger_immediate) campaign={} reclamada a mano", campaign_id);

        let coordinator = Arc::clone(&self.coordinator);
        let id = campaign_id.to_string();
        tokio::spawn(async move {
            match coordinator.dispatch_claimed(&id).await {
                Ok(outcome) => log::debug!("(trigger_immediate) campaign={} -> {:?}", id, outcome),
                Err(e) => log::error!("(trigger_immediate) campaign={}: {}", id, e),
            }
        });

        self.load(campaign_id).await
    }

    pub async fn schedule_campaign(
        &self,
        campaign_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Result<Campaign> {
        if scheduled_time <= Utc::now() {
            return Err(Error::validation("scheduled_time must be in the future"));
        }
        if !self
            .store
            .schedule_campaign(campaign_id, scheduled_time)
            .await?
        {
            let campaign = self.load(campaign_id).await?;
            return Err(Error::validation(format!(
                "a {} campaign cannot be scheduled",
                campaign.status
            )));
        }
        log::info!(
            "(schedule_campaign) campaign={} programada para {}",
            campaign_id,
            scheduled_time
        );
        self.load(campaign_id).await
    }

    /// `pending` o `sending` -> `cancelled`. Un dispatch en curso lo nota en el
    /// próximo contacto.
    pub async fn cancel_schedule(&self, campaign_id: &str) -> Result<Campaign> {
        if !self.store.cancel_campaign(campaign_id).await? {
            let campaign = self.load(campaign_id).await?;
            return Err(Error::validation(format!(
                "a {} campaign cannot be cancelled",
                campaign.status
            )));
        }
        log::info!("(cancel_schedule) campaign={} cancelada", campaign_id);
        self.load(campaign_id).await
    }

    pub async fn get_campaign_status(&self, campaign_id: &str) -> Result<CampaignStatusResponse> {
        let campaign = self.load(campaign_id).await?;
        let deliveries = self.ledger.summary(campaign_id).await?;
        Ok(CampaignStatusResponse {
            campaign,
            deliveries,
        })
    }

    pub async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        self.store.list_campaigns(tenant_id).await
    }

    pub async fn chat_links(&self, campaign_id: &str) -> Result<Vec<ChatLink>> {
        let campaign = self.load(campaign_id).await?;
        let recipients = self
            .store
            .list_recipients(&campaign.tenant_id, campaign.group_filter.as_deref())
            .await?;
        Ok(template_service::chat_links(
            &campaign.message_template,
            &recipients,
            &self.default_country_code,
        ))
    }

    pub async fn chat_links_csv(&self, campaign_id: &str) -> Result<String> {
        let links = self.chat_links(campaign_id).await?;
        Ok(template_service::chat_links_csv(&links))
    }

    async fn load(&self, campaign_id: &str) -> Result<Campaign> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| Error::campaign_not_found(campaign_id))
    }
}
