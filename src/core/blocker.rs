//! Blocker abstraction.
//!
//! A blocker is a backend able to apply and remove traffic filtering for a
//! mitigation scope. Backends are created from configuration through the
//! [`BlockerRegistry`], which maps a backend kind tag to a factory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::http_blocker::HttpBlocker;
use crate::core::scope::{MitigationScope, ScopeInstanceId};
use crate::models::BlockerConfig;

/// Errors that can occur during blocker operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockerError {
    #[error("Unknown blocker kind: {0}")]
    UnknownKind(String),
    #[error("Invalid blocker configuration: {0}")]
    InvalidConfiguration(String),
    #[error("No blocker available for scope instance {0}")]
    NoBlockerAvailable(ScopeInstanceId),
    #[error("Blocker selection aborted: {0}")]
    SelectionAborted(String),
    #[error("Protection {0} is not registered")]
    UnknownProtection(Uuid),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Handle for a protection registered on a blocker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protection {
    id: Uuid,
    scope_instance_id: ScopeInstanceId,
    mitigation_id: i64,
    blocker_id: String,
    enabled: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Protection {
    pub fn new(scope: &MitigationScope, blocker_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope_instance_id: scope.scope_instance_id,
            mitigation_id: scope.mitigation_id,
            blocker_id: blocker_id.to_string(),
            enabled: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope_instance_id(&self) -> ScopeInstanceId {
        self.scope_instance_id
    }

    pub fn mitigation_id(&self) -> i64 {
        self.mitigation_id
    }

    /// Id of the blocker that owns this protection
    pub fn blocker_id(&self) -> &str {
        &self.blocker_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Record that the backend started filtering
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.enabled = true;
        self.started_at = Some(at);
        self.finished_at = None;
    }

    /// Record that the backend stopped filtering
    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.enabled = false;
        self.finished_at = Some(at);
    }
}

impl redis::FromRedisValue for Protection {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value)
            .map_err(|e| redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse Protection from JSON",
                e.to_string(),
            )))
    }
}

/// Capability interface every blocker backend implements
#[async_trait]
pub trait Blocker: Send + Sync {
    /// Unique id of this blocker instance
    fn id(&self) -> &str;

    /// Backend kind tag
    fn kind(&self) -> &str;

    /// Maximum number of protections this blocker accepts
    fn capacity(&self) -> usize {
        usize::MAX
    }

    /// Number of protections currently registered
    fn load(&self) -> usize {
        0
    }

    /// Register a scope with the backend and return its protection handle.
    async fn register_protection(&self, scope: &MitigationScope) -> Result<Protection, BlockerError>;

    /// Start filtering for a registered protection.
    async fn execute_protection(&self, protection: &mut Protection) -> Result<(), BlockerError>;

    /// Forget a registered protection (rollback path).
    async fn unregister_protection(&self, protection: &Protection) -> Result<(), BlockerError>;

    /// Stop filtering for a running protection.
    async fn stop_protection(&self, protection: &mut Protection) -> Result<(), BlockerError>;
}

/// Factory producing a blocker from its configuration
pub type BlockerFactory =
    Box<dyn Fn(&BlockerConfig) -> Result<Arc<dyn Blocker>, BlockerError> + Send + Sync>;

/// Maps backend kind tags to blocker factories
pub struct BlockerRegistry {
    factories: HashMap<String, BlockerFactory>,
}

impl BlockerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with the built-in `log` and `http` backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("log", Box::new(log_blocker_factory));
        registry.register("http", Box::new(http_blocker_factory));
        registry
    }

    /// Register (or replace) the factory for a backend kind
    pub fn register(&mut self, kind: &str, factory: BlockerFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Instantiate one blocker
    pub fn build(&self, config: &BlockerConfig) -> Result<Arc<dyn Blocker>, BlockerError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| BlockerError::UnknownKind(config.kind.clone()))?;
        factory(config)
    }

    /// Instantiate every configured blocker, rejecting duplicate ids
    pub fn build_pool(&self, configs: &[BlockerConfig]) -> Result<Vec<Arc<dyn Blocker>>, BlockerError> {
        let mut seen = HashSet::new();
        let mut pool = Vec::with_capacity(configs.len());
        for config in configs {
            if !seen.insert(config.id.clone()) {
                return Err(BlockerError::InvalidConfiguration(format!(
                    "duplicate blocker id {}",
                    config.id
                )));
            }
            pool.push(self.build(config)?);
        }
        Ok(pool)
    }
}

fn log_blocker_factory(config: &BlockerConfig) -> Result<Arc<dyn Blocker>, BlockerError> {
    Ok(Arc::new(LogBlocker::new(config)))
}

fn http_blocker_factory(config: &BlockerConfig) -> Result<Arc<dyn Blocker>, BlockerError> {
    Ok(Arc::new(HttpBlocker::from_config(config)?))
}

impl Default for BlockerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// In-process blocker that logs protections instead of programming a device
pub struct LogBlocker {
    id: String,
    capacity: usize,
    registered: Mutex<HashSet<Uuid>>,
}

impl LogBlocker {
    pub fn new(config: &BlockerConfig) -> Self {
        Self {
            id: config.id.clone(),
            capacity: config.capacity,
            registered: Mutex::new(HashSet::new()),
        }
    }

    fn with_registered<T>(&self, f: impl FnOnce(&mut HashSet<Uuid>) -> T) -> Result<T, BlockerError> {
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| BlockerError::Backend("protection table poisoned".to_string()))?;
        Ok(f(&mut registered))
    }
}

#[async_trait]
impl Blocker for LogBlocker {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "log"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn load(&self) -> usize {
        self.with_registered(|registered| registered.len()).unwrap_or(0)
    }

    async fn register_protection(&self, scope: &MitigationScope) -> Result<Protection, BlockerError> {
        let protection = Protection::new(scope, &self.id);
        let capacity = self.capacity;
        self.with_registered(|registered| {
            if registered.len() >= capacity {
                return Err(BlockerError::NoBlockerAvailable(scope.scope_instance_id));
            }
            registered.insert(protection.id());
            Ok(())
        })??;
        info!(
            "[{}] registered protection {} for mitigation {} (scope instance {})",
            self.id,
            protection.id(),
            scope.mitigation_id,
            scope.scope_instance_id
        );
        Ok(protection)
    }

    async fn execute_protection(&self, protection: &mut Protection) -> Result<(), BlockerError> {
        if !self.with_registered(|registered| registered.contains(&protection.id()))? {
            return Err(BlockerError::UnknownProtection(protection.id()));
        }
        protection.mark_started(Utc::now());
        info!("[{}] started protection {}", self.id, protection.id());
        Ok(())
    }

    async fn unregister_protection(&self, protection: &Protection) -> Result<(), BlockerError> {
        self.with_registered(|registered| registered.remove(&protection.id()))?;
        info!("[{}] unregistered protection {}", self.id, protection.id());
        Ok(())
    }

    async fn stop_protection(&self, protection: &mut Protection) -> Result<(), BlockerError> {
        self.with_registered(|registered| registered.remove(&protection.id()))?;
        protection.mark_stopped(Utc::now());
        info!("[{}] stopped protection {}", self.id, protection.id());
        Ok(())
    }
}
