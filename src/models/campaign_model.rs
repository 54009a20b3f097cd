//! models/campaign_model.rs
//! Campañas de difusión y sus requests/responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::models::delivery_model::DeliverySummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
    NoContacts,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Pending => "pending",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::NoContacts => "no_contacts",
        }
    }

    /// Estados de los que la campaña ya no sale por sí sola.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Sent
                | CampaignStatus::Failed
                | CampaignStatus::Cancelled
                | CampaignStatus::NoContacts
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "pending" => Ok(CampaignStatus::Pending),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "no_contacts" => Ok(CampaignStatus::NoContacts),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Plantilla con placeholders: {name}, {phone}, {group}
    pub message_template: String,
    pub media_url: Option<String>,
    /// Si viene, solo se envía a los contactos de ese grupo
    pub group_filter: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Última señal de vida de un dispatch en curso
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request para crear una campaña
#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub tenant_id: String,
    pub name: Option<String>,
    pub message_template: String,
    pub media_url: Option<String>,
    pub group_filter: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleCampaignRequest {
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListCampaignsQuery {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatusResponse {
    pub campaign: Campaign,
    pub deliveries: DeliverySummary,
}

/// Enlace wa.me personalizado (envío manual, sin sesión vinculada)
#[derive(Debug, Clone, Serialize)]
pub struct ChatLink {
    pub name: String,
    pub phone: String,
    pub message: String,
    pub link: String,
}
