//! Configuration management for the DOTS server.
//!
//! This module handles loading the application configuration from an
//! optional TOML file layered under `DOTS__*` environment variables.

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(&config_file)
}

/// Load configuration from the given file (missing files fall back to defaults)
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.enabled", false)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("lifetime.active_but_terminating_period", 120)?
        .set_default("lifetime.max_active_but_terminating_period", 300)?
        .set_default("lifetime.sweep_interval_seconds", 1)?
        .set_default("lifetime.conflict_retry_timer", 120)?
        .set_default("selection.queue_size", 64)?
        .set_default("metrics.enabled", false)?
        .set_default("metrics.listen", "127.0.0.1:9100")?
        .add_source(File::with_name(config_file).required(false))
        .add_source(Environment::with_prefix("DOTS").separator("__"))
        .build()?;

    let mut config: Config = config.try_deserialize()?;
    if config.blockers.is_empty() {
        config.blockers = Config::default().blockers;
    }
    if config.lifetime.sweep_interval_seconds == 0 {
        return Err(ConfigError::Message(
            "lifetime.sweep_interval_seconds must be greater than zero".to_string(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_from("config/does-not-exist").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.lifetime.active_but_terminating_period, 120);
        assert_eq!(config.lifetime.sweep_interval_seconds, 1);
        assert_eq!(config.blockers.len(), 1);
        assert_eq!(config.blockers[0].kind, "log");
    }
}
