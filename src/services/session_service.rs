//! services/session_service.rs
//! Messaging Session Manager: ciclo de vida de la conexión de canal por tenant
//! (desafío de vinculación, persistencia del blob, reconexión con backoff).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    channels::{
        ChannelAdapter, ChannelAdapterFactory, ChannelError, ChannelEvent, ChannelEventReceiver,
        ChannelEventSender, DisconnectReason,
    },
    config::SessionConfig,
    errors::{Error, Result},
    models::session_model::{
        LinkChallenge, LinkResponse, SessionRecord, SessionStatus, SessionStatusResponse,
    },
    store::CampaignStore,
};

/// Espera antes del reintento `attempt` (1-based): `attempt * base`.
/// `None` cuando se agotaron los reintentos.
pub fn reconnect_delay(attempt: u32, config: &SessionConfig) -> Option<Duration> {
    if attempt == 0 || attempt > config.max_restarts {
        return None;
    }
    Some(Duration::from_millis(
        config.reconnect_base_ms.saturating_mul(u64::from(attempt)),
    ))
}

#[derive(Debug)]
struct TenantState {
    status: SessionStatus,
    challenge: Option<LinkChallenge>,
    restarts: u32,
    link_in_flight: bool,
    reconnect_pending: bool,
}

/// Una conexión viva por tenant. Los envíos pasan de a uno por `send_queue`.
/// `restore` guarda el blob persistido hasta que alguien lo restaura; el lock se
/// mantiene durante toda la restauración.
struct TenantSession {
    tenant_id: String,
    adapter: Arc<dyn ChannelAdapter>,
    state: StdMutex<TenantState>,
    send_queue: Mutex<()>,
    restore: Arc<Mutex<Option<Vec<u8>>>>,
}

impl TenantSession {
    fn state(&self) -> MutexGuard<'_, TenantState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> SessionStatus {
        self.state().status
    }
}

pub struct SessionManager {
    store: Arc<dyn CampaignStore>,
    factory: Arc<dyn ChannelAdapterFactory>,
    config: SessionConfig,
    tenants: RwLock<HashMap<String, Arc<TenantSession>>>,
    events_tx: ChannelEventSender,
    events_rx: StdMutex<Option<ChannelEventReceiver>>,
    persist_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        factory: Arc<dyn ChannelAdapterFactory>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            factory,
            config,
            tenants: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            persist_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Arranca la tarea que traduce los eventos del adaptador en transiciones.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.handle_event(event).await;
            }
        }))
    }

    pub async fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        let tenant_id = event.tenant_id().to_string();
        if !self.tenants.read().await.contains_key(&tenant_id) {
            log::debug!("(handle_event) Evento para tenant sin sesión viva: {}", tenant_id);
            return;
        }
        match event {
            ChannelEvent::ChallengeIssued { challenge, .. } => {
                self.on_challenge_issued(&tenant_id, challenge).await
            }
            ChannelEvent::Connected { .. } => self.on_connected(&tenant_id).await,
            ChannelEvent::Disconnected { reason, .. } => {
                self.on_disconnected(&tenant_id, reason).await
            }
            ChannelEvent::AuthFailure { message, .. } => {
                self.on_auth_failure(&tenant_id, &message).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Operaciones expuestas
    // ------------------------------------------------------------------

    /// Nunca espera la latencia del canal: si hay que pedir un desafío nuevo,
    /// se pide en segundo plano y se responde `Pending`.
    pub async fn request_link_challenge(
        self: &Arc<Self>,
        tenant_id: &str,
        phone_number: Option<String>,
    ) -> Result<LinkResponse> {
        let session = self.session_entry(tenant_id).await?;
        match Arc::clone(&session.restore).try_lock_owned() {
            // Otra llamada está restaurando el blob
            Err(_) => return Ok(LinkResponse::Pending),
            Ok(mut pending) => {
                if let Some(blob) = pending.take() {
                    // Sesión persistida: primero se intenta restaurar
                    let manager = Arc::clone(self);
                    let session = Arc::clone(&session);
                    tokio::spawn(async move {
                        manager.restore_session(&session, &blob).await;
                        drop(pending);
                    });
                    return Ok(LinkResponse::Pending);
                }
            }
        }

        {
            let mut state = session.state();
            match state.status {
                SessionStatus::Connected => return Ok(LinkResponse::Connected),
                SessionStatus::AwaitingLink if state.challenge.is_some() => {
                    if let Some(challenge) = state.challenge.clone() {
                        return Ok(LinkResponse::AwaitingLink { challenge });
                    }
                }
                _ => {}
            }
            if state.link_in_flight {
                return Ok(LinkResponse::Pending);
            }
            state.link_in_flight = true;
            state.status = SessionStatus::AwaitingLink;
            // Pedido explícito del usuario: vuelve a habilitar los reintentos
            state.restarts = 0;
        }
        self.persist(tenant_id, |rec| rec.status = SessionStatus::AwaitingLink)
            .await?;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager
                .issue_challenge(&session, phone_number.as_deref())
                .await;
        });
        Ok(LinkResponse::Pending)
    }

    pub async fn get_status(&self, tenant_id: &str) -> Result<SessionStatusResponse> {
        let record = self.store.get_session(tenant_id).await?;
        let has_persisted_state = record
            .as_ref()
            .is_some_and(|r| r.serialized_state.is_some());

        if let Some(session) = self.tenants.read().await.get(tenant_id) {
            let state = session.state();
            return Ok(SessionStatusResponse {
                tenant_id: tenant_id.to_string(),
                status: state.status,
                has_persisted_state,
                restarts: state.restarts,
            });
        }

        Ok(SessionStatusResponse {
            tenant_id: tenant_id.to_string(),
            status: record
                .map(|r| r.status)
                .unwrap_or(SessionStatus::Uninitialized),
            has_persisted_state,
            restarts: 0,
        })
    }

    pub async fn is_connected(&self, tenant_id: &str) -> bool {
        match self.tenants.read().await.get(tenant_id) {
            Some(session) => session.status() == SessionStatus::Connected,
            None => false,
        }
    }

    pub async fn current_challenge(&self, tenant_id: &str) -> Option<LinkChallenge> {
        let tenants = self.tenants.read().await;
        let session = tenants.get(tenant_id)?;
        let challenge = session.state().challenge.clone();
        challenge
    }

    /// Crea la sesión si hace falta (restaurando el blob persistido) y exige `connected`.
    /// Si otra tarea está restaurando, espera a que termine antes de mirar el estado.
    pub async fn ensure_connected(self: &Arc<Self>, tenant_id: &str) -> Result<()> {
        let session = self.session_entry(tenant_id).await?;
        {
            let mut pending = session.restore.lock().await;
            if let Some(blob) = pending.take() {
                self.restore_session(&session, &blob).await;
            }
        }
        if session.status() == SessionStatus::Connected {
            Ok(())
        } else {
            Err(Error::channel_unavailable(tenant_id))
        }
    }

    /// Un solo envío en vuelo por tenant.
    pub async fn send(
        self: &Arc<Self>,
        tenant_id: &str,
        address: &str,
        message: &str,
        media_url: Option<&str>,
    ) -> Result<()> {
        let session = self
            .tenants
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| Error::channel_unavailable(tenant_id))?;

        let result = {
            let _in_flight = session.send_queue.lock().await;
            if session.status() != SessionStatus::Connected {
                return Err(Error::channel_unavailable(tenant_id));
            }
            session.adapter.send(address, message, media_url).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                log::warn!(
                    "(send) La sesión de tenant={} se cayó durante un envío: {}",
                    tenant_id,
                    e
                );
                self.on_disconnected(tenant_id, DisconnectReason::Transient(e.to_string()))
                    .await;
                Err(Error::FatalChannel {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(Error::TransientSend {
                address: address.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Logout explícito: obliga a volver a vincular.
    pub async fn logout(self: &Arc<Self>, tenant_id: &str) -> Result<()> {
        let session = self.tenants.read().await.get(tenant_id).cloned();
        if let Some(session) = session {
            if let Err(e) = session.adapter.logout().await {
                log::warn!("(logout) El canal no confirmó el logout de {}: {}", tenant_id, e);
            }
        }
        self.on_disconnected(tenant_id, DisconnectReason::Logout)
            .await;
        // Sin sesión viva on_disconnected no persiste nada
        self.persist(tenant_id, |rec| {
            rec.status = SessionStatus::Disconnected;
            rec.serialized_state = None;
            rec.last_link_challenge = None;
        })
        .await
    }

    /// Reset externo: descarta la conexión viva y el contador de reintentos.
    /// El blob persistido se conserva.
    pub async fn reset(&self, tenant_id: &str) -> Result<()> {
        let removed = self.tenants.write().await.remove(tenant_id);
        if removed.is_some() {
            log::info!("(reset) Sesión de tenant={} descartada", tenant_id);
        }
        self.persist(tenant_id, |rec| {
            rec.status = SessionStatus::Uninitialized;
            rec.last_link_challenge = None;
        })
        .await
    }

    /// Reconstruye las sesiones con blob persistido, escalonando los tenants.
    pub async fn recover_sessions(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let records: Vec<SessionRecord> = self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(|r| r.serialized_state.is_some())
            .collect();
        log::info!(
            "(recover_sessions) {} sesiones persistidas para restaurar",
            records.len()
        );

        let manager = Arc::clone(self);
        let stagger = Duration::from_millis(self.config.startup_stagger_ms);
        Ok(tokio::spawn(async move {
            let mut restores = Vec::with_capacity(records.len());
            for (i, record) in records.into_iter().enumerate() {
                if i > 0 && !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                let tenant_id = record.tenant_id.clone();
                let session = match manager.session_entry(&tenant_id).await {
                    Ok(session) => session,
                    Err(e) => {
                        log::error!("(recover_sessions) tenant={}: {}", tenant_id, e);
                        continue;
                    }
                };
                // El lock se toma antes del spawn: quien llegue después espera la restauración
                let mut pending = Arc::clone(&session.restore).lock_owned().await;
                let Some(blob) = pending.take() else { continue };
                let m = Arc::clone(&manager);
                restores.push(tokio::spawn(async move {
                    m.restore_session(&session, &blob).await;
                    drop(pending);
                }));
            }
            futures::future::join_all(restores).await;
        }))
    }

    // ------------------------------------------------------------------
    // Transiciones (invocadas desde el borde del adaptador)
    // ------------------------------------------------------------------

    pub async fn on_challenge_issued(&self, tenant_id: &str, challenge: LinkChallenge) {
        let Some(session) = self.tenants.read().await.get(tenant_id).cloned() else {
            return;
        };
        {
            let mut state = session.state();
            state.status = SessionStatus::AwaitingLink;
            state.challenge = Some(challenge.clone());
            state.link_in_flight = false;
        }
        log::info!(
            "(on_challenge_issued) Desafío {:?} listo para tenant={}",
            challenge.kind,
            tenant_id
        );
        self.persist_logged(tenant_id, |rec| {
            rec.status = SessionStatus::AwaitingLink;
            rec.last_link_challenge = Some(challenge);
        })
        .await;
    }

    pub async fn on_connected(&self, tenant_id: &str) {
        let Some(session) = self.tenants.read().await.get(tenant_id).cloned() else {
            return;
        };
        let blob = match session.adapter.serialize().await {
            Ok(blob) => Some(blob),
            Err(e) => {
                log::warn!(
                    "(on_connected) No se pudo serializar la sesión de {}: {}",
                    tenant_id,
                    e
                );
                None
            }
        };
        {
            let mut state = session.state();
            state.status = SessionStatus::Connected;
            state.challenge = None;
            state.restarts = 0;
            state.link_in_flight = false;
        }
        log::info!("(on_connected) tenant={} CONNECTED", tenant_id);
        self.persist_logged(tenant_id, |rec| {
            rec.status = SessionStatus::Connected;
            rec.last_link_challenge = None;
            if blob.is_some() {
                rec.serialized_state = blob;
            }
        })
        .await;
    }

    pub async fn on_disconnected(self: &Arc<Self>, tenant_id: &str, reason: DisconnectReason) {
        let Some(session) = self.tenants.read().await.get(tenant_id).cloned() else {
            return;
        };
        match reason {
            DisconnectReason::Logout => {
                {
                    let mut state = session.state();
                    state.status = SessionStatus::Disconnected;
                    state.challenge = None;
                    state.restarts = 0;
                }
                log::info!("(on_disconnected) tenant={} hizo logout", tenant_id);
                self.persist_logged(tenant_id, |rec| {
                    rec.status = SessionStatus::Disconnected;
                    rec.serialized_state = None;
                    rec.last_link_challenge = None;
                })
                .await;
            }
            DisconnectReason::Transient(detail) => {
                session.state().status = SessionStatus::Disconnected;
                log::warn!("(on_disconnected) tenant={} desconectado: {}", tenant_id, detail);
                self.persist_logged(tenant_id, |rec| rec.status = SessionStatus::Disconnected)
                    .await;
                self.schedule_reconnect(&session).await;
            }
        }
    }

    pub async fn on_auth_failure(self: &Arc<Self>, tenant_id: &str, message: &str) {
        let Some(session) = self.tenants.read().await.get(tenant_id).cloned() else {
            return;
        };
        {
            let mut state = session.state();
            state.status = SessionStatus::AuthFailure;
            state.challenge = None;
        }
        log::error!("(on_auth_failure) tenant={}: {}", tenant_id, message);
        self.persist_logged(tenant_id, |rec| {
            rec.status = SessionStatus::AuthFailure;
            rec.serialized_state = None;
            rec.last_link_challenge = None;
        })
        .await;
        self.schedule_reconnect(&session).await;
    }

    // ------------------------------------------------------------------
    // Internos
    // ------------------------------------------------------------------

    /// Devuelve la sesión viva, creándola si no existe. Si se acaba de crear y hay
    /// blob persistido, queda en `restore` hasta que un llamador lo restaure.
    async fn session_entry(&self, tenant_id: &str) -> Result<Arc<TenantSession>> {
        if let Some(session) = self.tenants.read().await.get(tenant_id) {
            return Ok(Arc::clone(session));
        }

        let record = self.store.get_session(tenant_id).await?;
        let mut tenants = self.tenants.write().await;
        if let Some(session) = tenants.get(tenant_id) {
            return Ok(Arc::clone(session));
        }

        let blob = record.as_ref().and_then(|r| r.serialized_state.clone());
        let status = match (&record, &blob) {
            (None, _) => SessionStatus::Uninitialized,
            (Some(_), Some(_)) => SessionStatus::Disconnected,
            (Some(r), None) if r.status == SessionStatus::Connected => SessionStatus::Disconnected,
            (Some(r), None) => r.status,
        };

        let session = Arc::new(TenantSession {
            tenant_id: tenant_id.to_string(),
            adapter: self.factory.create(tenant_id, self.events_tx.clone()),
            state: StdMutex::new(TenantState {
                status,
                challenge: record.and_then(|r| r.last_link_challenge),
                restarts: 0,
                link_in_flight: false,
                reconnect_pending: false,
            }),
            send_queue: Mutex::new(()),
            restore: Arc::new(Mutex::new(blob)),
        });
        tenants.insert(tenant_id.to_string(), Arc::clone(&session));
        log::debug!("(session_entry) Sesión creada para tenant={} ({})", tenant_id, status);
        Ok(session)
    }

    async fn restore_session(self: &Arc<Self>, session: &Arc<TenantSession>, blob: &[u8]) {
        let tenant_id = session.tenant_id.as_str();
        match session.adapter.restore(blob).await {
            Ok(()) => {
                log::info!("(restore_session) Sesión restaurada para tenant={}", tenant_id);
                self.on_connected(tenant_id).await;
            }
            Err(ChannelError::RestoreRejected(detail)) => {
                log::warn!(
                    "(restore_session) Blob rechazado para tenant={}: {}. Se pide nuevo desafío.",
                    tenant_id,
                    detail
                );
                self.persist_logged(tenant_id, |rec| rec.serialized_state = None)
                    .await;
                {
                    let mut state = session.state();
                    state.status = SessionStatus::AwaitingLink;
                    state.link_in_flight = true;
                }
                self.issue_challenge(session, None).await;
            }
            Err(e) => {
                self.on_disconnected(tenant_id, DisconnectReason::Transient(e.to_string()))
                    .await;
            }
        }
    }

    async fn issue_challenge(self: &Arc<Self>, session: &Arc<TenantSession>, phone: Option<&str>) {
        let tenant_id = session.tenant_id.as_str();
        match session.adapter.request_link_challenge(phone).await {
            Ok(challenge) => self.on_challenge_issued(tenant_id, challenge).await,
            Err(e) => {
                log::error!(
                    "(issue_challenge) No se obtuvo desafío para tenant={}: {}",
                    tenant_id,
                    e
                );
                {
                    let mut state = session.state();
                    state.status = SessionStatus::Error;
                    state.link_in_flight = false;
                }
                self.persist_logged(tenant_id, |rec| rec.status = SessionStatus::Error)
                    .await;
            }
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>, session: &Arc<TenantSession>) {
        let tenant_id = session.tenant_id.clone();
        let delay = {
            let mut state = session.state();
            if state.reconnect_pending {
                return;
            }
            state.restarts += 1;
            let delay = reconnect_delay(state.restarts, &self.config);
            match delay {
                Some(_) => state.reconnect_pending = true,
                None => state.status = SessionStatus::Error,
            }
            delay
        };

        let Some(delay) = delay else {
            log::error!(
                "(schedule_reconnect) tenant={} agotó {} reintentos; requiere reset externo",
                tenant_id,
                self.config.max_restarts
            );
            self.persist_logged(&tenant_id, |rec| rec.status = SessionStatus::Error)
                .await;
            return;
        };

        log::info!(
            "(schedule_reconnect) tenant={} reintenta en {:?}",
            tenant_id,
            delay
        );
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.state().reconnect_pending = false;
            manager.reconnect(session).await;
        });
    }

    /// Devuelve un `BoxFuture` porque cierra el ciclo
    /// restore -> disconnect -> schedule_reconnect -> reconnect.
    fn reconnect(self: Arc<Self>, session: Arc<TenantSession>) -> BoxFuture<'static, ()> {
        async move {
            let tenant_id = session.tenant_id.as_str();
            // Un reset pudo haber reemplazado esta sesión
            let still_live = self
                .tenants
                .read()
                .await
                .get(tenant_id)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if !still_live || session.status() == SessionStatus::Connected {
                return;
            }

            let blob = match self.store.get_session(tenant_id).await {
                Ok(record) => record.and_then(|r| r.serialized_state),
                Err(e) => {
                    log::error!("(reconnect) Store inaccesible para tenant={}: {}", tenant_id, e);
                    self.on_disconnected(tenant_id, DisconnectReason::Transient(e.to_string()))
                        .await;
                    return;
                }
            };

            // Mientras se reintenta, ensure_connected espera el resultado
            let mut pending = session.restore.lock().await;
            *pending = None;
            match blob {
                Some(blob) => self.restore_session(&session, &blob).await,
                None => {
                    {
                        let mut state = session.state();
                        state.status = SessionStatus::AwaitingLink;
                        state.link_in_flight = true;
                    }
                    self.issue_challenge(&session, None).await;
                }
            }
        }
        .boxed()
    }

    fn persist_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.persist_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(tenant_id.to_string()).or_default())
    }

    /// Leer-modificar-escribir la fila del tenant, de a uno por tenant.
    async fn persist(&self, tenant_id: &str, f: impl FnOnce(&mut SessionRecord)) -> Result<()> {
        let lock = self.persist_lock(tenant_id);
        let _guard = lock.lock().await;
        let mut record = self
            .store
            .get_session(tenant_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(tenant_id));
        f(&mut record);
        record.updated_at = Utc::now();
        self.store.save_session(&record).await
    }

    async fn persist_logged(&self, tenant_id: &str, f: impl FnOnce(&mut SessionRecord)) {
        if let Err(e) = self.persist(tenant_id, f).await {
            log::error!(
                "(persist) No se pudo guardar la sesión de tenant={}: {}",
                tenant_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::tests::support::{FakeChannel, FakeChannelFactory, FAKE_BLOB};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_persists_keep_the_blob() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("sessions.db").display());
        let store = Arc::new(SqliteStore::connect(&url, 4).await.unwrap());
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(FakeChannelFactory(FakeChannel::new())),
            SessionConfig::default(),
        );

        let mut writers = Vec::new();
        for i in 0..20 {
            let m = Arc::clone(&manager);
            writers.push(tokio::spawn(async move {
                if i == 10 {
                    m.persist("t1", |rec| {
                        rec.status = SessionStatus::Connected;
                        rec.serialized_state = Some(FAKE_BLOB.to_vec());
                    })
                    .await
                } else {
                    m.persist("t1", |rec| rec.last_link_challenge = None).await
                }
            }));
        }
        for writer in futures::future::join_all(writers).await {
            writer.unwrap().unwrap();
        }

        let record = store.get_session("t1").await.unwrap().unwrap();
        assert_eq!(record.serialized_state.as_deref(), Some(FAKE_BLOB));
        assert_eq!(record.status, SessionStatus::Connected);
    }

    #[test]
    fn backoff_grows_linearly_and_is_bounded() {
        let config = SessionConfig::default();
        let delays: Vec<Duration> = (1..=config.max_restarts)
            .filter_map(|n| reconnect_delay(n, &config))
            .collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_secs(10));
        assert_eq!(delays[4], Duration::from_secs(50));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reconnect_delay(config.max_restarts + 1, &config), None);
        assert_eq!(reconnect_delay(0, &config), None);
    }
}
