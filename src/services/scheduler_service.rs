//! services/scheduler_service.rs
//! Timer periódico que reclama campañas vencidas y retoma dispatches huérfanos.

use std::sync::Arc;

use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    config::SchedulerConfig,
    errors::Result,
    models::campaign_model::CampaignStatus,
    services::dispatch_service::{DispatchCoordinator, DispatchOutcome},
    store::CampaignStore,
};

pub struct SchedulerLoop {
    store: Arc<dyn CampaignStore>,
    coordinator: Arc<DispatchCoordinator>,
    config: SchedulerConfig,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        coordinator: Arc<DispatchCoordinator>,
        config: SchedulerConfig,
    ) -> Self {
        SchedulerLoop {
            store,
            coordinator,
            config,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        log::info!(
            "(start) Scheduler cada {}s (stale tras {}s)",
            self.config.tick_secs,
            self.config.stale_after_secs
        );
        tokio::spawn(async move {
            let mut ticker = interval(self.config.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    log::warn!("(start) Tick abortado, se reintenta en el próximo: {}", e);
                }
            }
        })
    }

    /// Un tick: solo lecturas hasta encontrar trabajo. Cada claim y su dispatch
    /// corren en su propia tarea; se devuelven los handles.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let now = Utc::now();
        let due = self.store.get_due_campaigns(now).await?;
        let stale = if self.config.stale_after_secs > 0 {
            let cutoff = now - chrono::Duration::seconds(self.config.stale_after_secs as i64);
            self.store.get_stale_campaigns(cutoff).await?
        } else {
            Vec::new()
        };

        if !due.is_empty() || !stale.is_empty() {
            log::info!(
                "(tick) {} campañas vencidas, {} dispatches huérfanos",
                due.len(),
                stale.len()
            );
        }

        let mut handles = Vec::with_capacity(due.len() + stale.len());
        for campaign in due {
            let coordinator = Arc::clone(&self.coordinator);
            handles.push(tokio::spawn(async move {
                let result = coordinator
                    .claim_and_dispatch(&campaign.id, &[CampaignStatus::Pending])
                    .await;
                log_outcome("claim_and_dispatch", &campaign.id, result);
            }));
        }
        for campaign in stale {
            let coordinator = Arc::clone(&self.coordinator);
            handles.push(tokio::spawn(async move {
                let result = coordinator.reclaim_and_resume(&campaign).await;
                log_outcome("reclaim_and_resume", &campaign.id, result);
            }));
        }
        Ok(handles)
    }
}

fn log_outcome(op: &str, campaign_id: &str, result: Result<DispatchOutcome>) {
    match result {
        Ok(DispatchOutcome::AlreadyClaimed) => {}
        Ok(outcome) => log::debug!("({}) campaign={} -> {:?}", op, campaign_id, outcome),
        Err(e) => log::error!("({}) campaign={}: {}", op, campaign_id, e),
    }
}
