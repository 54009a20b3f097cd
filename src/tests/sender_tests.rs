//! tests/sender_tests.rs
//! Ritmo, tope diario, fallos individuales, caída del canal y cancelación.
//! Corren con el reloj de tokio pausado: las esperas avanzan al instante.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::config::SenderConfig;
    use crate::errors::Error;
    use crate::models::campaign_model::CampaignStatus;
    use crate::models::delivery_model::{DeliveryStatus, DeliverySummary};
    use crate::models::session_model::SessionStatus;
    use crate::services::dispatch_service::DispatchOutcome;
    use crate::services::sender_service::{SKIP_CANCELLED, SKIP_CHANNEL_DROPPED, SKIP_DAILY_CAP};
    use crate::store::{CampaignStore, InMemoryStore};
    use crate::tests::support::{fast_sender_config, Harness};

    fn paced_config() -> SenderConfig {
        SenderConfig {
            min_interval_ms: 5_000,
            jitter_max_ms: 3_000,
            batch_size: 10,
            batch_cooldown_ms: 60_000,
            daily_cap: 500,
            default_country_code: "233".to_string(),
        }
    }

    async fn harness(config: SenderConfig) -> Harness {
        let h = Harness::new(Arc::new(InMemoryStore::new()), config);
        h.connect("t1").await;
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_lower_bound() {
        let h = harness(paced_config()).await;
        let k: u64 = 23;
        h.seed_many("t1", k as usize).await;
        let campaign = h.draft("t1", "Hello {name}").await;

        let start = Instant::now();
        let outcome = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(matches!(outcome, DispatchOutcome::Sent(s) if s.sent == k as u32));
        let lower_bound = Duration::from_millis(5_000 * (k - 1) + 60_000 * ((k - 1) / 10));
        assert!(
            elapsed >= lower_bound,
            "took {elapsed:?}, expected at least {lower_bound:?}"
        );

        let sent = h.channel.sent();
        assert_eq!(sent.len(), k as usize);
        for pair in sent.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(5_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dispatches_share_tenant_spacing() {
        let config = SenderConfig {
            jitter_max_ms: 0,
            batch_cooldown_ms: 0,
            ..paced_config()
        };
        let h = harness(config).await;
        h.seed_many("t1", 3).await;
        let a = h.draft("t1", "A").await;
        let b = h.draft("t1", "B").await;

        let (ra, rb) = tokio::join!(
            h.coordinator
                .claim_and_dispatch(&a.id, &[CampaignStatus::Draft]),
            h.coordinator
                .claim_and_dispatch(&b.id, &[CampaignStatus::Draft]),
        );
        ra.unwrap();
        rb.unwrap();

        let mut sent = h.channel.sent();
        assert_eq!(sent.len(), 6);
        sent.sort_by_key(|m| m.at);
        for pair in sent.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(5_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_cap_counts_attempts_across_campaigns() {
        let config = SenderConfig {
            daily_cap: 500,
            ..fast_sender_config()
        };
        let h = harness(config).await;
        h.seed_many("t1", 600).await;
        let campaign = h.draft("t1", "promo").await;

        let outcome = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Sent(DeliverySummary {
                sent: 500,
                failed: 0,
                skipped: 100
            })
        );
        let records = h.ledger.records(&campaign.id).await.unwrap();
        let skipped: Vec<_> = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 100);
        assert!(skipped
            .iter()
            .all(|r| r.error_detail.as_deref() == Some(SKIP_DAILY_CAP)));

        // El tope es por tenant y por día, no por campaña
        let second = h.draft("t1", "promo again").await;
        let outcome = h
            .coordinator
            .claim_and_dispatch(&second.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent(s) if s.sent == 0 && s.skipped == 600));
        assert_eq!(h.channel.attempts(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_cap_is_seeded_from_ledger() {
        let config = SenderConfig {
            daily_cap: 3,
            ..fast_sender_config()
        };
        let h = harness(config).await;
        let recipients = h.seed_many("t1", 4).await;
        let earlier = h.draft("t1", "earlier").await;
        h.ledger
            .record_sent(&earlier, &recipients[0], "earlier")
            .await
            .unwrap();
        h.ledger
            .record_failed(&earlier, &recipients[1], Some("earlier"), "rejected")
            .await
            .unwrap();

        let campaign = h.draft("t1", "now").await;
        let outcome = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent(s) if s.sent == 1 && s.skipped == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_recipient_failures_do_not_abort() {
        let h = harness(fast_sender_config()).await;
        h.channel.script(|s| {
            s.reject_addresses.insert("2330002".to_string());
        });
        h.seed_recipients(
            "t1",
            &[
                ("Amy", "2330001"),
                ("Bo", "2330002"),
                ("Nobody", "n/a"),
                ("Dee", "0550004"),
            ],
        )
        .await;
        let campaign = h.draft("t1", "Hi {name}").await;

        let outcome = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Sent(DeliverySummary {
                sent: 2,
                failed: 2,
                skipped: 0
            })
        );
        // La dirección inválida nunca llega al canal
        assert_eq!(h.channel.attempts(), 3);
        let addresses: Vec<String> = h.channel.sent().into_iter().map(|m| m.address).collect();
        assert_eq!(addresses, vec!["2330001", "233550004"]);
        assert_eq!(
            h.store.get_campaign_status(&campaign.id).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_drop_mid_run_fails_campaign() {
        let h = harness(fast_sender_config()).await;
        h.channel.script(|s| s.drop_at_send = Some(3));
        h.seed_many("t1", 5).await;
        let campaign = h.draft("t1", "hello").await;

        let outcome = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));

        let summary = h.ledger.summary(&campaign.id).await.unwrap();
        assert_eq!(summary, DeliverySummary { sent: 2, failed: 1, skipped: 2 });
        let records = h.ledger.records(&campaign.id).await.unwrap();
        assert!(records[3..]
            .iter()
            .all(|r| r.error_detail.as_deref() == Some(SKIP_CHANNEL_DROPPED)));

        let stored = h.store.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed);
        assert!(stored.error_message.is_some());
        assert_eq!(
            h.sessions.get_status("t1").await.unwrap().status,
            SessionStatus::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_dispatch_allows_at_most_one_more_send() {
        let config = SenderConfig {
            jitter_max_ms: 0,
            ..paced_config()
        };
        let h = harness(config).await;
        h.seed_many("t1", 10).await;
        let campaign = h.draft("t1", "hello").await;

        let coordinator = h.coordinator.clone();
        let id = campaign.id.clone();
        let dispatch = tokio::spawn(async move {
            coordinator
                .claim_and_dispatch(&id, &[CampaignStatus::Draft])
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        assert!(h.store.cancel_campaign(&campaign.id).await.unwrap());
        let sent_at_cancel = h.channel.sent().len();

        let outcome = dispatch.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Cancelled(_)));

        let sent = h.channel.sent().len();
        assert!(sent <= sent_at_cancel + 1);
        let summary = h.ledger.summary(&campaign.id).await.unwrap();
        assert_eq!(summary.sent as usize, sent);
        assert_eq!(summary.skipped as usize, 10 - sent);
        let records = h.ledger.records(&campaign.id).await.unwrap();
        assert!(records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Skipped)
            .all(|r| r.error_detail.as_deref() == Some(SKIP_CANCELLED)));
        assert_eq!(
            h.store.get_campaign_status(&campaign.id).await.unwrap(),
            Some(CampaignStatus::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_campaign_is_not_retriggered() {
        let h = harness(fast_sender_config()).await;
        h.channel.script(|s| s.drop_at_send = Some(2));
        h.seed_recipients("t1", &[("Amy", "2330001"), ("Bo", "2330002"), ("Cy", "2330003")])
            .await;
        let campaign = h.draft("t1", "Hi {name}!").await;

        let first = h
            .coordinator
            .claim_and_dispatch(&campaign.id, &[CampaignStatus::Draft])
            .await
            .unwrap();
        assert!(matches!(first, DispatchOutcome::Failed { .. }));

        // La sesión vuelve, pero `failed` es terminal
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.sessions.is_connected("t1").await);
        let err = h
            .campaign_service()
            .trigger_immediate(&campaign.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let addresses: Vec<String> = h.channel.sent().into_iter().map(|m| m.address).collect();
        assert_eq!(addresses, vec!["2330001"]);
        assert_eq!(
            h.store.get_campaign_status(&campaign.id).await.unwrap(),
            Some(CampaignStatus::Failed)
        );
    }
}
