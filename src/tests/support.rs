//! tests/support.rs
//! Canal falso programable y armado del motor completo para los tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::{
    channels::{ChannelAdapter, ChannelAdapterFactory, ChannelError, ChannelEventSender},
    config::{SchedulerConfig, SenderConfig, SessionConfig},
    models::{
        campaign_model::{Campaign, NewCampaign},
        recipient_model::{NewRecipient, Recipient},
        session_model::{LinkChallenge, LinkChallengeKind, SessionRecord, SessionStatus},
    },
    services::{
        campaign_service::CampaignService, dispatch_service::DispatchCoordinator,
        ledger_service::DeliveryLedger, scheduler_service::SchedulerLoop,
        sender_service::RateLimitedSender, session_service::SessionManager,
    },
    store::CampaignStore,
};

/// Blob que el canal falso entrega en `serialize()`; no es UTF-8 a propósito.
pub const FAKE_BLOB: &[u8] = b"\x00fake-session\xffv1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestoreBehavior {
    #[default]
    Accept,
    /// El blob ya no sirve
    Reject,
    /// Falla de red: cuenta como desconexión transitoria
    Transient,
}

#[derive(Debug, Default)]
pub struct ChannelScript {
    pub reject_addresses: HashSet<String>,
    /// El envío número N (1-based, contando todos los intentos) tira la sesión
    pub drop_at_send: Option<usize>,
    pub restore: RestoreBehavior,
    pub challenge_delay: Duration,
    pub restore_delay: Duration,
    pub send_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub tenant_id: String,
    pub address: String,
    pub message: String,
    pub at: Instant,
}

/// Estado compartido por todos los adaptadores que crea la fábrica.
#[derive(Default)]
pub struct FakeChannel {
    script: Mutex<ChannelScript>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
    restores: Mutex<Vec<(String, Instant)>>,
    challenges: AtomicUsize,
    logouts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, f: impl FnOnce(&mut ChannelScript)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> Vec<(String, Instant)> {
        self.restores.lock().unwrap().clone()
    }

    pub fn challenges(&self) -> usize {
        self.challenges.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct FakeAdapter {
    tenant_id: String,
    channel: Arc<FakeChannel>,
    _events: ChannelEventSender,
}

#[async_trait]
impl ChannelAdapter for FakeAdapter {
    async fn request_link_challenge(
        &self,
        phone_number: Option<&str>,
    ) -> Result<LinkChallenge, ChannelError> {
        let n = self.channel.challenges.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.channel.script.lock().unwrap().challenge_delay;
        tokio::time::sleep(delay).await;
        Ok(LinkChallenge {
            kind: if phone_number.is_some() {
                LinkChallengeKind::PairingCode
            } else {
                LinkChallengeKind::Qr
            },
            payload: format!("challenge-{n}"),
            issued_at: Utc::now(),
        })
    }

    async fn send(
        &self,
        address: &str,
        message: &str,
        _media_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        let n = self.channel.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let (drop_now, rejected, delay) = {
            let script = self.channel.script.lock().unwrap();
            (
                script.drop_at_send == Some(n),
                script.reject_addresses.contains(address),
                script.send_delay,
            )
        };
        if drop_now {
            return Err(ChannelError::Disconnected("stream closed".into()));
        }
        if rejected {
            return Err(ChannelError::Rejected(format!("{address} is not on the network")));
        }

        let now_in_flight = self.channel.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.channel
            .max_in_flight
            .fetch_max(now_in_flight, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.channel.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.channel.sent.lock().unwrap().push(SentMessage {
            tenant_id: self.tenant_id.clone(),
            address: address.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn serialize(&self) -> Result<Vec<u8>, ChannelError> {
        Ok(FAKE_BLOB.to_vec())
    }

    async fn restore(&self, blob: &[u8]) -> Result<(), ChannelError> {
        self.channel
            .restores
            .lock()
            .unwrap()
            .push((self.tenant_id.clone(), Instant::now()));
        let (behavior, delay) = {
            let script = self.channel.script.lock().unwrap();
            (script.restore, script.restore_delay)
        };
        tokio::time::sleep(delay).await;
        match behavior {
            RestoreBehavior::Accept if blob == FAKE_BLOB => Ok(()),
            RestoreBehavior::Accept | RestoreBehavior::Reject => {
                Err(ChannelError::RestoreRejected("session expired".into()))
            }
            RestoreBehavior::Transient => Err(ChannelError::Transport("connection reset".into())),
        }
    }

    async fn logout(&self) -> Result<(), ChannelError> {
        self.channel.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeChannelFactory(pub Arc<FakeChannel>);

impl ChannelAdapterFactory for FakeChannelFactory {
    fn create(&self, tenant_id: &str, events: ChannelEventSender) -> Arc<dyn ChannelAdapter> {
        Arc::new(FakeAdapter {
            tenant_id: tenant_id.to_string(),
            channel: Arc::clone(&self.0),
            _events: events,
        })
    }
}

/// Sin pausas: para tests que no miden tiempos.
pub fn fast_sender_config() -> SenderConfig {
    SenderConfig {
        min_interval_ms: 0,
        jitter_max_ms: 0,
        batch_size: 10,
        batch_cooldown_ms: 0,
        daily_cap: 500,
        default_country_code: "233".to_string(),
    }
}

pub fn session_manager(store: Arc<dyn CampaignStore>, channel: &Arc<FakeChannel>) -> Arc<SessionManager> {
    SessionManager::new(
        store,
        Arc::new(FakeChannelFactory(Arc::clone(channel))),
        SessionConfig::default(),
    )
}

/// Un "proceso" completo del motor sobre el store dado.
pub struct Harness {
    pub store: Arc<dyn CampaignStore>,
    pub channel: Arc<FakeChannel>,
    pub sessions: Arc<SessionManager>,
    pub ledger: DeliveryLedger,
    pub coordinator: Arc<DispatchCoordinator>,
    pub sender_config: SenderConfig,
}

impl Harness {
    pub fn new(store: Arc<dyn CampaignStore>, sender_config: SenderConfig) -> Self {
        let channel = FakeChannel::new();
        let sessions = session_manager(store.clone(), &channel);
        let ledger = DeliveryLedger::new(store.clone());
        let sender = Arc::new(RateLimitedSender::new(
            sender_config.clone(),
            store.clone(),
            ledger.clone(),
            sessions.clone(),
        ));
        let coordinator = Arc::new(DispatchCoordinator::new(
            store.clone(),
            sessions.clone(),
            sender,
        ));
        Harness {
            store,
            channel,
            sessions,
            ledger,
            coordinator,
            sender_config,
        }
    }

    /// Deja al tenant `connected` restaurando un blob válido.
    pub async fn connect(&self, tenant_id: &str) {
        let mut record = SessionRecord::new(tenant_id);
        record.status = SessionStatus::Connected;
        record.serialized_state = Some(FAKE_BLOB.to_vec());
        self.store.save_session(&record).await.unwrap();
        self.sessions
            .ensure_connected(tenant_id)
            .await
            .expect("fake channel should restore a valid blob");
    }

    pub async fn seed_recipients(&self, tenant_id: &str, people: &[(&str, &str)]) -> Vec<Recipient> {
        let mut out = Vec::with_capacity(people.len());
        for (name, address) in people {
            out.push(self.add_recipient(tenant_id, name, address, None).await);
        }
        out
    }

    pub async fn seed_many(&self, tenant_id: &str, count: usize) -> Vec<Recipient> {
        let mut out = Vec::with_capacity(count);
        for n in 0..count {
            out.push(
                self.add_recipient(tenant_id, &format!("Contact {n}"), &format!("233{n:07}"), None)
                    .await,
            );
        }
        out
    }

    pub async fn add_recipient(
        &self,
        tenant_id: &str,
        name: &str,
        address: &str,
        group: Option<&str>,
    ) -> Recipient {
        self.store
            .add_recipient(&NewRecipient {
                tenant_id: tenant_id.into(),
                display_name: name.into(),
                address: address.into(),
                group_tag: group.map(str::to_string),
            })
            .await
            .unwrap()
    }

    /// Campaña en `draft`.
    pub async fn draft(&self, tenant_id: &str, template: &str) -> Campaign {
        self.store
            .create_campaign(&new_campaign(tenant_id, template, None))
            .await
            .unwrap()
    }

    /// Campaña `pending` que ya venció.
    pub async fn due(&self, tenant_id: &str, template: &str) -> Campaign {
        let when = Utc::now() - chrono::Duration::seconds(1);
        self.store
            .create_campaign(&new_campaign(tenant_id, template, Some(when)))
            .await
            .unwrap()
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> SchedulerLoop {
        SchedulerLoop::new(self.store.clone(), self.coordinator.clone(), config)
    }

    pub fn campaign_service(&self) -> CampaignService {
        CampaignService::new(
            self.store.clone(),
            self.coordinator.clone(),
            self.ledger.clone(),
            self.sender_config.default_country_code.clone(),
        )
    }
}

pub fn new_campaign(
    tenant_id: &str,
    template: &str,
    scheduled_time: Option<chrono::DateTime<Utc>>,
) -> NewCampaign {
    NewCampaign {
        tenant_id: tenant_id.into(),
        name: None,
        message_template: template.into(),
        media_url: None,
        group_filter: None,
        scheduled_time,
    }
}

/// Espera (con tiempo real) a que la campaña salga de `sending`.
pub async fn wait_until_settled(store: &Arc<dyn CampaignStore>, campaign_id: &str) -> Campaign {
    for _ in 0..500 {
        let campaign = store.get_campaign(campaign_id).await.unwrap().unwrap();
        if campaign.status.is_terminal() {
            return campaign;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("campaign {campaign_id} never left sending");
}
