//! errors.rs
//! Taxonomía de errores del motor de difusión.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Entrada inválida del llamador. No se reintenta.
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Otra instancia ganó el claim. Nunca llega a un usuario final.
    #[error("campaign {campaign_id} already claimed")]
    ClaimConflict { campaign_id: String },

    #[error("no connected channel session for tenant {tenant_id}")]
    ChannelUnavailable { tenant_id: String },

    #[error("send to {address} failed: {reason}")]
    TransientSend { address: String, reason: String },

    #[error("channel session dropped: {reason}")]
    FatalChannel { reason: String },

    #[error(transparent)]
    Persistence(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn campaign_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "campaign",
            id: id.into(),
        }
    }

    #[must_use]
    pub fn channel_unavailable(tenant_id: impl Into<String>) -> Self {
        Self::ChannelUnavailable {
            tenant_id: tenant_id.into(),
        }
    }

    /// Caída del Store: aborta el tick/operación actual y se reintenta en el siguiente.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Migrate(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
