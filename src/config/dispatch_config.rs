//! config/dispatch_config.rs
//! Configuración del motor de difusión, con valores por defecto.
//! Se sobreescribe con variables de entorno (.env incluido).

use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

/// Límites de ritmo del Rate-Limited Sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    pub min_interval_ms: u64,
    pub jitter_max_ms: u64,
    pub batch_size: u32,
    pub batch_cooldown_ms: u64,
    /// Máximo de envíos por tenant por día (UTC)
    pub daily_cap: u32,
    /// Reemplaza el 0 inicial de los números locales
    pub default_country_code: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            min_interval_ms: 5_000,
            jitter_max_ms: 5_000,
            batch_size: 10,
            batch_cooldown_ms: 60_000,
            daily_cap: 500,
            default_country_code: "233".to_string(),
        }
    }
}

impl SenderConfig {
    pub fn from_env() -> Self {
        let d = SenderConfig::default();
        SenderConfig {
            min_interval_ms: env_or("SENDER_MIN_INTERVAL_MS", d.min_interval_ms),
            jitter_max_ms: env_or("SENDER_JITTER_MAX_MS", d.jitter_max_ms),
            batch_size: env_or("SENDER_BATCH_SIZE", d.batch_size),
            batch_cooldown_ms: env_or("SENDER_BATCH_COOLDOWN_MS", d.batch_cooldown_ms),
            daily_cap: env_or("SENDER_DAILY_CAP", d.daily_cap),
            default_country_code: env_or("SENDER_DEFAULT_COUNTRY_CODE", d.default_country_code),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    /// Un dispatch en `sending` sin heartbeat por este tiempo se considera caído
    pub stale_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_secs: 60,
            stale_after_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = SchedulerConfig::default();
        SchedulerConfig {
            tick_secs: env_or("SCHEDULER_TICK_SECS", d.tick_secs).max(1),
            stale_after_secs: env_or("SCHEDULER_STALE_AFTER_SECS", d.stale_after_secs),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_restarts: u32,
    /// El intento N espera N * base
    pub reconnect_base_ms: u64,
    /// Pausa entre tenants al recuperar sesiones en el arranque
    pub startup_stagger_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_restarts: 5,
            reconnect_base_ms: 10_000,
            startup_stagger_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let d = SessionConfig::default();
        SessionConfig {
            max_restarts: env_or("SESSION_MAX_RESTARTS", d.max_restarts),
            reconnect_base_ms: env_or("SESSION_RECONNECT_BASE_MS", d.reconnect_base_ms),
            startup_stagger_ms: env_or("SESSION_STARTUP_STAGGER_MS", d.startup_stagger_ms),
        }
    }
}

/// Sidecar HTTP que mantiene las sesiones del canal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub status_poll_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ChannelApiConfig {
    fn default() -> Self {
        ChannelApiConfig {
            base_url: "http://localhost:3000".to_string(),
            api_key: None,
            status_poll_secs: 15,
            request_timeout_secs: 30,
        }
    }
}

impl ChannelApiConfig {
    pub fn from_env() -> Self {
        let d = ChannelApiConfig::default();
        ChannelApiConfig {
            base_url: env::var("CHANNEL_API_URL").unwrap_or(d.base_url),
            api_key: env::var("CHANNEL_API_KEY").ok().filter(|k| !k.is_empty()),
            status_poll_secs: env_or("CHANNEL_STATUS_POLL_SECS", d.status_poll_secs).max(1),
            request_timeout_secs: env_or("CHANNEL_REQUEST_TIMEOUT_SECS", d.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub http_bind: String,
    pub http_port: u16,
    pub sender: SenderConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub channel: ChannelApiConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        AppConfig {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/broadcast.db".to_string()),
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env_or("HTTP_PORT", 5022),
            sender: SenderConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            session: SessionConfig::from_env(),
            channel: ChannelApiConfig::from_env(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("(config) Valor inválido para {}='{}', se usa el default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let s = SenderConfig::default();
        assert_eq!(s.min_interval_ms, 5_000);
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.batch_cooldown_ms, 60_000);
        assert_eq!(s.daily_cap, 500);

        let sess = SessionConfig::default();
        assert_eq!(sess.max_restarts, 5);
        assert_eq!(sess.reconnect_base_ms, 10_000);

        assert_eq!(SchedulerConfig::default().tick(), Duration::from_secs(60));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        env::set_var("BROADCAST_TEST_GARBAGE_U32", "not-a-number");
        assert_eq!(env_or("BROADCAST_TEST_GARBAGE_U32", 7u32), 7);
        env::set_var("BROADCAST_TEST_GOOD_U32", " 42 ");
        assert_eq!(env_or("BROADCAST_TEST_GOOD_U32", 7u32), 42);
        assert_eq!(env_or("BROADCAST_TEST_MISSING_U32", 9u32), 9);
    }
}
