use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Whether scopes and aliases are persisted in Redis (in-memory otherwise)
    pub enabled: bool,
    /// Redis connection URL
    pub url: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Mitigation lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeConfig {
    /// Grace period (seconds) a deleted mitigation stays active-but-terminating
    pub active_but_terminating_period: i64,
    /// Lifetime (seconds) forced on an update of an active-but-terminating mitigation
    pub max_active_but_terminating_period: i64,
    /// Lifetime sweeper polling interval in seconds
    pub sweep_interval_seconds: u64,
    /// Retry timer (seconds) advertised to clients in conflict responses
    pub conflict_retry_timer: u64,
}

/// Blocker selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Capacity of the selection work queue
    pub queue_size: usize,
}

/// A configured blocker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerConfig {
    /// Unique blocker id
    pub id: String,
    /// Backend kind tag, resolved through the blocker registry
    pub kind: String,
    /// Maximum number of protections this blocker accepts
    #[serde(default = "default_blocker_capacity")]
    pub capacity: usize,
    /// Backend specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_blocker_capacity() -> usize {
    1024
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus exporter
    pub enabled: bool,
    /// Exporter listen address
    pub listen: String,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Lifetime configuration
    pub lifetime: LifetimeConfig,
    /// Selection configuration
    pub selection: SelectionConfig,
    /// Blocker instances
    #[serde(default)]
    pub blockers: Vec<BlockerConfig>,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            active_but_terminating_period: 120,
            max_active_but_terminating_period: 300,
            sweep_interval_seconds: 1,
            conflict_retry_timer: 120,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                enabled: false,
                url: "redis://127.0.0.1:6379".to_string(),
            },
            lifetime: LifetimeConfig::default(),
            selection: SelectionConfig { queue_size: 64 },
            blockers: vec![BlockerConfig {
                id: "log-0".to_string(),
                kind: "log".to_string(),
                capacity: default_blocker_capacity(),
                params: HashMap::new(),
            }],
            metrics: MetricsConfig {
                enabled: false,
                listen: "127.0.0.1:9100".to_string(),
            },
        }
    }
}
