//! models/mod.rs
//! Módulo raíz para modelos/estructuras compartidas.

pub mod campaign_model;
pub mod delivery_model;
pub mod recipient_model;
pub mod session_model;

use chrono::{DateTime, TimeZone, Utc};

/// Las fechas se guardan en la DB como epoch millis.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
