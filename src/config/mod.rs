//! Configuration management for the huddle service
//!
//! Configuration is loaded from defaults, an optional TOML file and environment
//! variables, then validated before the service starts.

pub mod app;

pub use app::{validate_config, AmqpSettings, AppConfig, MatchmakingSettings, ServiceSettings};
