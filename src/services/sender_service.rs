//! services/sender_service.rs
//! Rate-Limited Sender: recorre los contactos en orden, con pausas, tope diario
//! por tenant y cancelación cooperativa.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{NaiveDate, Utc};
use rand::Rng;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    config::SenderConfig,
    errors::{Error, Result},
    models::{
        campaign_model::{Campaign, CampaignStatus},
        delivery_model::DeliverySummary,
        recipient_model::Recipient,
    },
    services::{
        ledger_service::DeliveryLedger,
        session_service::SessionManager,
        template_service::{normalize_address, personalize},
    },
    store::CampaignStore,
};

pub const SKIP_CANCELLED: &str = "cancelled";
pub const SKIP_DAILY_CAP: &str = "daily cap reached";
pub const SKIP_CHANNEL_DROPPED: &str = "channel session dropped";

/// Cómo terminó una corrida del sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Se recorrió la lista (o se alcanzó el tope diario). Los fallos
    /// individuales no cambian este resultado.
    Completed(DeliverySummary),
    /// La campaña dejó de estar en `sending` durante la corrida.
    Cancelled(DeliverySummary),
    /// Se cayó la sesión del canal a mitad de la corrida.
    Fatal {
        summary: DeliverySummary,
        reason: String,
    },
}

impl SendOutcome {
    pub fn summary(&self) -> DeliverySummary {
        match self {
            SendOutcome::Completed(s) | SendOutcome::Cancelled(s) => *s,
            SendOutcome::Fatal { summary, .. } => *summary,
        }
    }
}

/// Intentos por tenant en el día UTC actual, compartidos por todos los dispatches.
/// Se siembra desde el ledger la primera vez de cada día.
#[derive(Default)]
struct DailyQuota {
    counters: Mutex<HashMap<String, (NaiveDate, u32)>>,
}

impl DailyQuota {
    /// Reserva un intento; `false` si el tenant ya llegó al tope.
    async fn try_acquire(&self, ledger: &DeliveryLedger, tenant_id: &str, cap: u32) -> Result<bool> {
        let now = Utc::now();
        let today = now.date_naive();
        let mut counters = self.counters.lock().await;

        let count = match counters.get(tenant_id) {
            Some((day, count)) if *day == today => *count,
            _ => ledger.attempts_on_day(tenant_id, now).await?,
        };
        if count >= cap {
            counters.insert(tenant_id.to_string(), (today, count));
            return Ok(false);
        }
        counters.insert(tenant_id.to_string(), (today, count + 1));
        Ok(true)
    }
}

pub struct RateLimitedSender {
    config: SenderConfig,
    store: Arc<dyn CampaignStore>,
    ledger: DeliveryLedger,
    sessions: Arc<SessionManager>,
    quota: DailyQuota,
    /// Instante del último envío por tenant
    last_send: StdMutex<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl RateLimitedSender {
    pub fn new(
        config: SenderConfig,
        store: Arc<dyn CampaignStore>,
        ledger: DeliveryLedger,
        sessions: Arc<SessionManager>,
    ) -> Self {
        RateLimitedSender {
            config,
            store,
            ledger,
            sessions,
            quota: DailyQuota::default(),
            last_send: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Envía `campaign` a `recipients` en el orden dado. Los contactos que ya tienen
    /// una fila `sent` para esta campaña se saltan (reanudación).
    ///
    /// Solo devuelve `Err` si el Store falla; en ese caso la campaña queda en
    /// `sending` y la recupera el scheduler cuando su heartbeat envejece.
    pub async fn run(&self, campaign: &Campaign, recipients: &[Recipient]) -> Result<SendOutcome> {
        let already_sent = self.ledger.sent_recipient_ids(&campaign.id).await?;
        let pending = pending_recipients(recipients, &already_sent);
        if pending.len() < recipients.len() {
            log::info!(
                "(run) campaign={} reanuda: {} contactos ya tenían envío",
                campaign.id,
                recipients.len() - pending.len()
            );
        }

        let mut summary = DeliverySummary::default();
        let last = pending.len().saturating_sub(1);

        for (idx, recipient) in pending.iter().enumerate() {
            let status = self.store.get_campaign_status(&campaign.id).await?;
            if status != Some(CampaignStatus::Sending) {
                log::info!(
                    "(run) campaign={} ya no está en sending ({:?}); se detiene en el contacto {}",
                    campaign.id,
                    status,
                    idx
                );
                summary.skipped += self
                    .ledger
                    .record_skipped(campaign, &pending[idx..], SKIP_CANCELLED)
                    .await?;
                return Ok(SendOutcome::Cancelled(summary));
            }

            match normalize_address(&recipient.address, &self.config.default_country_code) {
                None => {
                    log::debug!(
                        "(run) campaign={} recipient={} dirección inválida '{}'",
                        campaign.id,
                        recipient.id,
                        recipient.address
                    );
                    self.ledger
                        .record_failed(
                            campaign,
                            recipient,
                            None,
                            &format!("invalid address: {}", recipient.address),
                        )
                        .await?;
                    summary.failed += 1;
                }
                Some(address) => {
                    if !self
                        .quota
                        .try_acquire(&self.ledger, &campaign.tenant_id, self.config.daily_cap)
                        .await?
                    {
                        log::info!(
                            "(run) tenant={} alcanzó el tope diario de {}; {} contactos quedan sin enviar",
                            campaign.tenant_id,
                            self.config.daily_cap,
                            pending.len() - idx
                        );
                        summary.skipped += self
                            .ledger
                            .record_skipped(campaign, &pending[idx..], SKIP_DAILY_CAP)
                            .await?;
                        return Ok(SendOutcome::Completed(summary));
                    }

                    let message = personalize(&campaign.message_template, recipient);
                    self.wait_for_pacing(&campaign.tenant_id).await;
                    match self
                        .sessions
                        .send(
                            &campaign.tenant_id,
                            &address,
                            &message,
                            campaign.media_url.as_deref(),
                        )
                        .await
                    {
                        Ok(()) => {
                            log::debug!(
                                "(run) campaign={} recipient={} enviado",
                                campaign.id,
                                recipient.id
                            );
                            self.ledger.record_sent(campaign, recipient, &message).await?;
                            summary.sent += 1;
                        }
                        Err(Error::TransientSend { reason, .. }) => {
                            log::debug!(
                                "(run) campaign={} recipient={} falló: {}",
                                campaign.id,
                                recipient.id,
                                reason
                            );
                            self.ledger
                                .record_failed(campaign, recipient, Some(&message), &reason)
                                .await?;
                            summary.failed += 1;
                        }
                        Err(e @ (Error::FatalChannel { .. } | Error::ChannelUnavailable { .. })) => {
                            let reason = e.to_string();
                            log::warn!(
                                "(run) campaign={} abortada en el contacto {}: {}",
                                campaign.id,
                                idx,
                                reason
                            );
                            self.ledger
                                .record_failed(campaign, recipient, Some(&message), &reason)
                                .await?;
                            summary.failed += 1;
                            summary.skipped += self
                                .ledger
                                .record_skipped(campaign, &pending[idx + 1..], SKIP_CHANNEL_DROPPED)
                                .await?;
                            return Ok(SendOutcome::Fatal { summary, reason });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            self.store.touch_campaign(&campaign.id, Utc::now()).await?;

            if idx < last {
                tokio::time::sleep(self.interval_with_jitter()).await;
                let done = idx as u32 + 1;
                if self.config.batch_size > 0 && done % self.config.batch_size == 0 {
                    log::debug!(
                        "(run) campaign={} lote de {} completo; pausa de {}ms",
                        campaign.id,
                        self.config.batch_size,
                        self.config.batch_cooldown_ms
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.batch_cooldown_ms)).await;
                }
            }
        }

        Ok(SendOutcome::Completed(summary))
    }

    fn interval_with_jitter(&self) -> Duration {
        let jitter = if self.config.jitter_max_ms > 0 {
            rand::rng().random_range(0..=self.config.jitter_max_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.min_interval_ms + jitter)
    }

    /// Dos envíos del mismo tenant nunca quedan a menos de `min_interval_ms`,
    /// aunque vengan de dispatches distintos.
    async fn wait_for_pacing(&self, tenant_id: &str) {
        if self.config.min_interval_ms == 0 {
            return;
        }
        let gate = {
            let mut gates = self.last_send.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(gates.entry(tenant_id.to_string()).or_default())
        };
        let mut last = gate.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + Duration::from_millis(self.config.min_interval_ms)).await;
        }
        *last = Some(Instant::now());
    }
}

fn pending_recipients(recipients: &[Recipient], already_sent: &HashSet<i64>) -> Vec<Recipient> {
    recipients
        .iter()
        .filter(|r| !already_sent.contains(&r.id))
        .cloned()
        .collect()
}
