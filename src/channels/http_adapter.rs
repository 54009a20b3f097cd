//! channels/http_adapter.rs
//! Adaptador contra un sidecar REST que mantiene una sesión de WhatsApp Web por tenant.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::{
    channels::{
        ChannelAdapter, ChannelAdapterFactory, ChannelError, ChannelEvent, ChannelEventSender,
        DisconnectReason,
    },
    config::ChannelApiConfig,
    models::session_model::{LinkChallenge, LinkChallengeKind},
};

const STATE_CONNECTED: &str = "CONNECTED";

#[derive(Clone)]
pub struct HttpChannelFactory {
    http_client: Client,
    config: ChannelApiConfig,
}

impl HttpChannelFactory {
    pub fn new(config: ChannelApiConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("(HttpChannelFactory) No se pudo construir el cliente: {:?}", e);
                Client::new()
            });
        Self {
            http_client,
            config,
        }
    }
}

impl ChannelAdapterFactory for HttpChannelFactory {
    fn create(&self, tenant_id: &str, events: ChannelEventSender) -> Arc<dyn ChannelAdapter> {
        let adapter = HttpChannelAdapter {
            http_client: self.http_client.clone(),
            base_url: self.config.base_url.trim_end_matches('/').to_string(),
            api_key: self.config.api_key.clone(),
            session_id: session_id_for(tenant_id),
            tenant_id: tenant_id.to_string(),
            poller: Mutex::new(None),
        };
        adapter.start_status_poller(events, Duration::from_secs(self.config.status_poll_secs));
        Arc::new(adapter)
    }
}

/// El sidecar identifica sesiones con [a-zA-Z0-9_-]
fn session_id_for(tenant_id: &str) -> String {
    let cleaned: String = tenant_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("tenant-{cleaned}")
}

pub struct HttpChannelAdapter {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    session_id: String,
    tenant_id: String,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HttpChannelAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl HttpChannelAdapter {
    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, self.session_id)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    async fn call(&self, req: RequestBuilder) -> Result<Response, ChannelError> {
        self.authed(req).send().await.map_err(map_transport_error)
    }

    async fn json_body(resp: Response) -> Result<Value, ChannelError> {
        resp.json::<Value>()
            .await
            .map_err(|e| ChannelError::Transport(format!("respuesta inválida del sidecar: {e}")))
    }

    async fn session_state(&self) -> Result<String, ChannelError> {
        let resp = self
            .call(self.http_client.get(self.url("session/status")))
            .await?;
        if !resp.status().is_success() {
            let body_txt = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "error consultando sesión: {body_txt}"
            )));
        }
        let json_val = Self::json_body(resp).await?;
        Ok(json_val
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string())
    }

    /// Convierte cambios de `/session/status` en eventos para el Session Manager.
    fn start_status_poller(&self, events: ChannelEventSender, every: Duration) {
        let http_client = self.http_client.clone();
        let url = self.url("session/status");
        let api_key = self.api_key.clone();
        let tenant_id = self.tenant_id.clone();

        let handle = tokio::spawn(async move {
            let mut last_state: Option<String> = None;
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut req = http_client.get(&url);
                if let Some(key) = &api_key {
                    req = req.header("x-api-key", key);
                }
                let state = match req.send().await {
                    Ok(resp) if resp.status().is_success() => resp
                        .json::<Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(str::to_string)),
                    Ok(resp) => {
                        log::debug!(
                            "(status_poller) tenant={} status HTTP {}",
                            tenant_id,
                            resp.status()
                        );
                        None
                    }
                    Err(e) => {
                        log::debug!("(status_poller) tenant={} sidecar inaccesible: {}", tenant_id, e);
                        None
                    }
                };
                let Some(state) = state else { continue };
                if last_state.as_deref() == Some(state.as_str()) {
                    continue;
                }

                let was_connected = last_state.as_deref() == Some(STATE_CONNECTED);
                let event = match state.as_str() {
                    STATE_CONNECTED => Some(ChannelEvent::Connected {
                        tenant_id: tenant_id.clone(),
                    }),
                    "LOGOUT" | "LOGGED_OUT" => Some(ChannelEvent::Disconnected {
                        tenant_id: tenant_id.clone(),
                        reason: DisconnectReason::Logout,
                    }),
                    "AUTH_FAILURE" => Some(ChannelEvent::AuthFailure {
                        tenant_id: tenant_id.clone(),
                        message: "sidecar reported auth failure".to_string(),
                    }),
                    other if was_connected => Some(ChannelEvent::Disconnected {
                        tenant_id: tenant_id.clone(),
                        reason: DisconnectReason::Transient(other.to_string()),
                    }),
                    _ => None,
                };
                last_state = Some(state);

                if let Some(ev) = event {
                    if events.send(ev).is_err() {
                        // El Session Manager ya no escucha
                        break;
                    }
                }
            }
        });

        *self.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

fn map_transport_error(e: reqwest::Error) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Timeout
    } else if e.is_connect() {
        ChannelError::Disconnected(format!("sidecar inaccesible: {e}"))
    } else {
        ChannelError::Transport(e.to_string())
    }
}

/// "233550001" -> "233550001@c.us"
fn chat_id(address: &str) -> String {
    if address.contains('@') {
        address.to_string()
    } else {
        format!("{address}@c.us")
    }
}

#[async_trait]
impl ChannelAdapter for HttpChannelAdapter {
    async fn request_link_challenge(
        &self,
        phone_number: Option<&str>,
    ) -> Result<LinkChallenge, ChannelError> {
        log::info!(
            "(request_link_challenge) Iniciando sesión {} en el sidecar...",
            self.session_id
        );
        let start = self
            .call(self.http_client.post(self.url("session/start")))
            .await?;
        // 422 = la sesión ya existía, se sigue igual
        if !start.status().is_success() && start.status() != StatusCode::UNPROCESSABLE_ENTITY {
            let body_txt = start.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "no se pudo iniciar la sesión: {body_txt}"
            )));
        }

        let (kind, resp) = match phone_number {
            Some(phone) => (
                LinkChallengeKind::PairingCode,
                self.call(
                    self.http_client
                        .post(self.url("session/pairing-code"))
                        .json(&json!({ "phoneNumber": phone })),
                )
                .await?,
            ),
            None => (
                LinkChallengeKind::Qr,
                self.call(self.http_client.get(self.url("session/qr")))
                    .await?,
            ),
        };

        if !resp.status().is_success() {
            let body_txt = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "el sidecar no entregó el desafío: {body_txt}"
            )));
        }
        let json_val = Self::json_body(resp).await?;
        let payload = json_val
            .get("qr")
            .or_else(|| json_val.get("code"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Transport("respuesta sin 'qr' ni 'code'".to_string()))?;

        Ok(LinkChallenge {
            kind,
            payload: payload.to_string(),
            issued_at: Utc::now(),
        })
    }

    async fn send(
        &self,
        address: &str,
        message: &str,
        media_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        let send_url = self.url("client/sendMessage");
        let target = chat_id(address);

        let payload = match media_url {
            Some(url) => json!({
                "chatId": target,
                "contentType": "MessageMediaFromURL",
                "content": url,
                "options": { "caption": message }
            }),
            None => json!({
                "chatId": target,
                "contentType": "string",
                "content": message
            }),
        };

        let r = self
            .call(self.http_client.post(&send_url).json(&payload))
            .await?;
        let status = r.status();
        if status.is_success() {
            return Ok(());
        }

        let body_txt = r.text().await.unwrap_or_default();
        if status.is_client_error() {
            if body_txt.to_lowercase().contains("not registered") {
                return Err(ChannelError::InvalidAddress(address.to_string()));
            }
            return Err(ChannelError::Rejected(body_txt));
        }

        // 5xx: distinguir un rechazo puntual de una sesión caída
        match self.session_state().await {
            Ok(state) if state == STATE_CONNECTED => Err(ChannelError::Rejected(body_txt)),
            Ok(state) => Err(ChannelError::Disconnected(state)),
            Err(e) => Err(e),
        }
    }

    async fn serialize(&self) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .call(self.http_client.get(self.url("session/export")))
            .await?;
        if !resp.status().is_success() {
            let body_txt = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "no se pudo exportar la sesión: {body_txt}"
            )));
        }
        let json_val = Self::json_body(resp).await?;
        let data = json_val
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Transport("export sin 'data'".to_string()))?;
        STANDARD
            .decode(data)
            .map_err(|e| ChannelError::Transport(format!("export con base64 inválido: {e}")))
    }

    async fn restore(&self, blob: &[u8]) -> Result<(), ChannelError> {
        let resp = self
            .call(
                self.http_client
                    .post(self.url("session/import"))
                    .json(&json!({ "data": STANDARD.encode(blob) })),
            )
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body_txt = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ChannelError::RestoreRejected(body_txt))
        } else {
            Err(ChannelError::Transport(body_txt))
        }
    }

    async fn logout(&self) -> Result<(), ChannelError> {
        let resp = self
            .call(self.http_client.post(self.url("session/logout")))
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ChannelError::Transport(
                resp.text().await.unwrap_or_default(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_sidecar_safe() {
        assert_eq!(session_id_for("acme"), "tenant-acme");
        assert_eq!(session_id_for("a b/c"), "tenant-a_b_c");
    }

    #[test]
    fn chat_id_appends_domain_once() {
        assert_eq!(chat_id("233550001"), "233550001@c.us");
        assert_eq!(chat_id("233550001@c.us"), "233550001@c.us");
    }

    #[test]
    fn only_disconnects_are_fatal() {
        assert!(ChannelError::Disconnected("x".into()).is_fatal());
        assert!(!ChannelError::Timeout.is_fatal());
        assert!(!ChannelError::Rejected("x".into()).is_fatal());
        assert!(!ChannelError::InvalidAddress("x".into()).is_fatal());
    }
}
