//! services/ledger_service.rs
//! Ledger de entregas: solo se agregan filas, nunca se actualizan ni se borran.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, NaiveTime, Utc};

use crate::{
    errors::Result,
    models::{
        campaign_model::Campaign,
        delivery_model::{DeliveryRecord, DeliveryStatus, DeliverySummary},
        recipient_model::Recipient,
    },
    store::CampaignStore,
};

#[derive(Clone)]
pub struct DeliveryLedger {
    store: Arc<dyn CampaignStore>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        DeliveryLedger { store }
    }

    pub async fn record_sent(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        message: &str,
    ) -> Result<()> {
        self.append(campaign, recipient, DeliveryStatus::Sent, Some(message), None)
            .await
    }

    pub async fn record_failed(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        message: Option<&str>,
        error: &str,
    ) -> Result<()> {
        self.append(campaign, recipient, DeliveryStatus::Failed, message, Some(error))
            .await
    }

    /// Una fila `skipped` por contacto; devuelve cuántas se escribieron.
    pub async fn record_skipped(
        &self,
        campaign: &Campaign,
        recipients: &[Recipient],
        reason: &str,
    ) -> Result<u32> {
        for recipient in recipients {
            self.append(campaign, recipient, DeliveryStatus::Skipped, None, Some(reason))
                .await?;
        }
        Ok(recipients.len() as u32)
    }

    async fn append(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        status: DeliveryStatus,
        message: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let record = DeliveryRecord {
            campaign_id: campaign.id.clone(),
            tenant_id: campaign.tenant_id.clone(),
            recipient_id: recipient.id,
            attempted_at: Utc::now(),
            status,
            message: message.map(str::to_string),
            error_detail: error.map(str::to_string),
        };
        log::debug!(
            "(ledger) campaign={} recipient={} -> {}",
            record.campaign_id,
            record.recipient_id,
            status.as_str()
        );
        self.store.append_delivery_record(&record).await
    }

    /// Contactos que ya recibieron la campaña (para reanudar sin duplicar).
    pub async fn sent_recipient_ids(&self, campaign_id: &str) -> Result<HashSet<i64>> {
        Ok(self
            .store
            .list_delivery_records(campaign_id)
            .await?
            .into_iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .map(|r| r.recipient_id)
            .collect())
    }

    pub async fn summary(&self, campaign_id: &str) -> Result<DeliverySummary> {
        let mut summary = DeliverySummary::default();
        for record in self.store.list_delivery_records(campaign_id).await? {
            summary.add(record.status);
        }
        Ok(summary)
    }

    pub async fn records(&self, campaign_id: &str) -> Result<Vec<DeliveryRecord>> {
        self.store.list_delivery_records(campaign_id).await
    }

    /// Intentos (sent + failed) del tenant en el día UTC de `now`.
    pub async fn attempts_on_day(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<u32> {
        self.store
            .count_attempts_since(tenant_id, start_of_day(now))
            .await
    }
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{campaign_model::NewCampaign, recipient_model::NewRecipient},
        store::InMemoryStore,
    };
    use chrono::TimeZone;

    #[test]
    fn start_of_day_truncates_to_midnight_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 17, 45, 3).unwrap();
        assert_eq!(
            start_of_day(ts),
            Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn summary_and_sent_ids_reflect_appended_rows() {
        let store = Arc::new(InMemoryStore::new());
        let campaign = store
            .create_campaign(&NewCampaign {
                tenant_id: "t1".into(),
                name: None,
                message_template: "hello".into(),
                media_url: None,
                group_filter: None,
                scheduled_time: None,
            })
            .await
            .unwrap();
        let mut recipients = Vec::new();
        for n in 0..3 {
            recipients.push(
                store
                    .add_recipient(&NewRecipient {
                        tenant_id: "t1".into(),
                        display_name: format!("r{n}"),
                        address: format!("23300{n}"),
                        group_tag: None,
                    })
                    .await
                    .unwrap(),
            );
        }

        let ledger = DeliveryLedger::new(store.clone());
        ledger.record_sent(&campaign, &recipients[0], "hello").await.unwrap();
        ledger
            .record_failed(&campaign, &recipients[1], Some("hello"), "rejected")
            .await
            .unwrap();
        ledger
            .record_skipped(&campaign, &recipients[2..], "cancelled")
            .await
            .unwrap();

        let summary = ledger.summary(&campaign.id).await.unwrap();
        assert_eq!(summary, DeliverySummary { sent: 1, failed: 1, skipped: 1 });
        let sent = ledger.sent_recipient_ids(&campaign.id).await.unwrap();
        assert_eq!(sent, HashSet::from([recipients[0].id]));
        assert_eq!(ledger.attempts_on_day("t1", Utc::now()).await.unwrap(), 2);
        assert_eq!(ledger.attempts_on_day("other", Utc::now()).await.unwrap(), 0);
    }
}
