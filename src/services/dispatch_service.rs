//! services/dispatch_service.rs
//! Dispatch Coordinator: claim atómico, envío y estado terminal de una campaña.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    errors::{Error, Result},
    models::{
        campaign_model::{Campaign, CampaignStatus},
        delivery_model::DeliverySummary,
    },
    services::{
        sender_service::{RateLimitedSender, SendOutcome},
        session_service::SessionManager,
    },
    store::CampaignStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Otra instancia ganó el claim; no es un error.
    AlreadyClaimed,
    NoContacts,
    Sent(DeliverySummary),
    Failed { reason: String },
    /// Cancelada desde afuera; su estado no se pisa.
    Cancelled(DeliverySummary),
}

pub struct DispatchCoordinator {
    store: Arc<dyn CampaignStore>,
    sessions: Arc<SessionManager>,
    sender: Arc<RateLimitedSender>,
}

impl DispatchCoordinator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        sessions: Arc<SessionManager>,
        sender: Arc<RateLimitedSender>,
    ) -> Self {
        DispatchCoordinator {
            store,
            sessions,
            sender,
        }
    }

    /// Claim `expected -> sending` y, si se gana, dispatch completo en esta misma tarea.
    pub async fn claim_and_dispatch(
        &self,
        campaign_id: &str,
        expected: &[CampaignStatus],
    ) -> Result<DispatchOutcome> {
        if !self
            .store
            .claim_campaign(campaign_id, expected, Utc::now())
            .await?
        {
            log::debug!("(claim_and_dispatch) campaign={} ya reclamada", campaign_id);
            return Ok(DispatchOutcome::AlreadyClaimed);
        }
        log::info!("(claim_and_dispatch) campaign={} reclamada", campaign_id);
        self.dispatch_claimed(campaign_id).await
    }

    /// Retoma un dispatch en `sending` cuyo dueño dejó de dar señales.
    pub async fn reclaim_and_resume(&self, campaign: &Campaign) -> Result<DispatchOutcome> {
        let Some(heartbeat) = campaign.heartbeat_at else {
            return Ok(DispatchOutcome::AlreadyClaimed);
        };
        if !self
            .store
            .reclaim_stale_campaign(&campaign.id, heartbeat, Utc::now())
            .await?
        {
            log::debug!("(reclaim_and_resume) campaign={} ya retomada", campaign.id);
            return Ok(DispatchOutcome::AlreadyClaimed);
        }
        log::warn!(
            "(reclaim_and_resume) campaign={} sin heartbeat desde {}; se reanuda",
            campaign.id,
            heartbeat
        );
        self.dispatch_claimed(&campaign.id).await
    }

    /// Requiere que la campaña ya esté en `sending` a nombre de esta tarea.
    pub async fn dispatch_claimed(&self, campaign_id: &str) -> Result<DispatchOutcome> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| Error::campaign_not_found(campaign_id))?;

        let recipients = self
            .store
            .list_recipients(&campaign.tenant_id, campaign.group_filter.as_deref())
            .await?;
        if recipients.is_empty() {
            log::info!("(dispatch_claimed) campaign={} sin contactos", campaign.id);
            return self
                .finish(&campaign, CampaignStatus::NoContacts, None, DispatchOutcome::NoContacts)
                .await;
        }

        if let Err(e) = self.sessions.ensure_connected(&campaign.tenant_id).await {
            return match e {
                Error::ChannelUnavailable { .. } => {
                    let reason = e.to_string();
                    log::warn!("(dispatch_claimed) campaign={}: {}", campaign.id, reason);
                    self.finish(
                        &campaign,
                        CampaignStatus::Failed,
                        Some(&reason),
                        DispatchOutcome::Failed { reason: reason.clone() },
                    )
                    .await
                }
                other => Err(other),
            };
        }

        log::info!(
            "(dispatch_claimed) campaign={} envía a {} contactos",
            campaign.id,
            recipients.len()
        );
        match self.sender.run(&campaign, &recipients).await? {
            SendOutcome::Completed(summary) => {
                self.finish(&campaign, CampaignStatus::Sent, None, DispatchOutcome::Sent(summary))
                    .await
            }
            SendOutcome::Fatal { summary, reason } => {
                log::warn!(
                    "(dispatch_claimed) campaign={} falló tras {} envíos: {}",
                    campaign.id,
                    summary.sent,
                    reason
                );
                self.finish(
                    &campaign,
                    CampaignStatus::Failed,
                    Some(&reason),
                    DispatchOutcome::Failed { reason: reason.clone() },
                )
                .await
            }
            SendOutcome::Cancelled(summary) => Ok(DispatchOutcome::Cancelled(summary)),
        }
    }

    /// Escribe el estado terminal solo si la campaña sigue en `sending`.
    async fn finish(
        &self,
        campaign: &Campaign,
        status: CampaignStatus,
        error_message: Option<&str>,
        outcome: DispatchOutcome,
    ) -> Result<DispatchOutcome> {
        if self
            .store
            .update_campaign_status(&campaign.id, status, error_message)
            .await?
        {
            log::info!("(finish) campaign={} -> {}", campaign.id, status);
            return Ok(outcome);
        }
        log::info!(
            "(finish) campaign={} cambió de estado durante el envío; no se pisa con {}",
            campaign.id,
            status
        );
        let summary = match outcome {
            DispatchOutcome::Sent(s) | DispatchOutcome::Cancelled(s) => s,
            _ => DeliverySummary::default(),
        };
        Ok(DispatchOutcome::Cancelled(summary))
    }
}
