//! channels/mod.rs
//! Interfaz que el núcleo necesita de un adaptador de canal de mensajería.
//! El protocolo concreto (QR, pairing, APIs del transporte) vive detrás de ella.

pub mod http_adapter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::session_model::LinkChallenge;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// El canal rechazó este mensaje concreto
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("channel request timed out")]
    Timeout,

    /// La sesión subyacente se cayó: fatal para el dispatch en curso
    #[error("session disconnected: {0}")]
    Disconnected(String),

    /// El blob persistido ya no sirve; hay que volver a vincular
    #[error("persisted session rejected: {0}")]
    RestoreRejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Disconnected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Logout explícito: se borra el estado serializado
    Logout,
    Transient(String),
}

/// Eventos que el adaptador reporta al Session Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    ChallengeIssued {
        tenant_id: String,
        challenge: LinkChallenge,
    },
    Connected {
        tenant_id: String,
    },
    Disconnected {
        tenant_id: String,
        reason: DisconnectReason,
    },
    AuthFailure {
        tenant_id: String,
        message: String,
    },
}

impl ChannelEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            ChannelEvent::ChallengeIssued { tenant_id, .. }
            | ChannelEvent::Connected { tenant_id }
            | ChannelEvent::Disconnected { tenant_id, .. }
            | ChannelEvent::AuthFailure { tenant_id, .. } => tenant_id,
        }
    }
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;
pub type ChannelEventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Una conexión de canal por tenant.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Con `phone_number` se pide un pairing code; sin él, un QR.
    async fn request_link_challenge(
        &self,
        phone_number: Option<&str>,
    ) -> Result<LinkChallenge, ChannelError>;

    async fn send(
        &self,
        address: &str,
        message: &str,
        media_url: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Blob opaco y versionado; el llamador no lo inspecciona.
    async fn serialize(&self) -> Result<Vec<u8>, ChannelError>;

    async fn restore(&self, blob: &[u8]) -> Result<(), ChannelError>;

    async fn logout(&self) -> Result<(), ChannelError>;
}

pub trait ChannelAdapterFactory: Send + Sync {
    fn create(&self, tenant_id: &str, events: ChannelEventSender) -> Arc<dyn ChannelAdapter>;
}
