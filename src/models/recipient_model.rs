use serde::{Deserialize, Serialize};

/// Contacto de un tenant. Solo lectura para el motor de envío.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub tenant_id: String,
    pub display_name: String,
    pub address: String,
    pub group_tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipient {
    pub tenant_id: String,
    pub display_name: String,
    pub address: String,
    pub group_tag: Option<String>,
}
