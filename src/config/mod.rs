//! config/mod.rs

pub mod dispatch_config;

pub use dispatch_config::{AppConfig, ChannelApiConfig, SchedulerConfig, SenderConfig, SessionConfig};
