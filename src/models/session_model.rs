//! models/session_model.rs
//! Estado persistido de la sesión de canal de cada tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    AwaitingLink,
    Connected,
    Disconnected,
    AuthFailure,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::AwaitingLink => "awaiting_link",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::AuthFailure => "auth_failure",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(SessionStatus::Uninitialized),
            "awaiting_link" => Ok(SessionStatus::AwaitingLink),
            "connected" => Ok(SessionStatus::Connected),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "auth_failure" => Ok(SessionStatus::AuthFailure),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkChallengeKind {
    /// Código escaneable (QR)
    Qr,
    /// Código alfanumérico corto para vincular por número
    PairingCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChallenge {
    pub kind: LinkChallengeKind,
    pub payload: String,
    pub issued_at: DateTime<Utc>,
}

/// Fila de `channel_sessions`. `serialized_state` es opaco: se guarda y se
/// devuelve byte a byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub tenant_id: String,
    pub status: SessionStatus,
    pub serialized_state: Option<Vec<u8>>,
    pub last_link_challenge: Option<LinkChallenge>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            status: SessionStatus::Uninitialized,
            serialized_state: None,
            last_link_challenge: None,
            updated_at: Utc::now(),
        }
    }
}

/// Respuesta de `request_link_challenge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkResponse {
    /// Ya vinculado; no hace falta desafío
    Connected,
    /// Desafío vigente, listo para mostrar al usuario
    AwaitingLink { challenge: LinkChallenge },
    /// Se pidió un desafío al canal; consultar de nuevo más tarde
    Pending,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkRequest {
    /// Si viene, se pide un pairing code para este número en vez de un QR
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusResponse {
    pub tenant_id: String,
    pub status: SessionStatus,
    pub has_persisted_state: bool,
    pub restarts: u32,
}
