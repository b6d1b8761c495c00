//! Remote blocker driven over a REST API.
//!
//! This module provides a blocker backend that forwards protections to an
//! external filtering controller (scrubbing center, BGP flowspec speaker
//! front end...) using bearer-token authenticated JSON requests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use crate::core::blocker::{Blocker, BlockerError, Protection};
use crate::core::scope::{MitigationScope, ScopeInstanceId};
use crate::core::target::PortRange;
use crate::models::BlockerConfig;

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Protection registration payload sent to the controller
#[derive(Debug, Serialize, PartialEq)]
pub struct ProtectionPayload {
    /// Protection ID
    pub protection_id: Uuid,
    /// Client assigned mitigation id
    pub mitigation_id: i64,
    /// Server assigned scope instance id
    pub scope_instance_id: ScopeInstanceId,
    /// Target prefixes in CIDR notation
    pub target_prefix: Vec<String>,
    /// Target port ranges
    pub target_port_range: Vec<PortRange>,
    /// Target protocol numbers
    pub target_protocol: Vec<u8>,
    /// Target FQDNs
    pub target_fqdn: Vec<String>,
    /// Target URIs
    pub target_uri: Vec<String>,
}

impl ProtectionPayload {
    pub fn new(protection: &Protection, scope: &MitigationScope) -> Self {
        Self {
            protection_id: protection.id(),
            mitigation_id: scope.mitigation_id,
            scope_instance_id: scope.scope_instance_id,
            target_prefix: scope.targets.prefixes.iter().map(|p| p.to_string()).collect(),
            target_port_range: scope.targets.port_ranges.clone(),
            target_protocol: scope.targets.protocols.iter().copied().collect(),
            target_fqdn: scope.targets.fqdns.iter().cloned().collect(),
            target_uri: scope.targets.uris.iter().cloned().collect(),
        }
    }
}

/// Blocker backed by a remote filtering controller
pub struct HttpBlocker {
    /// Blocker id
    id: String,
    /// HTTP client
    client: Client,
    /// Controller base URL
    endpoint: String,
    /// API token
    api_token: Option<String>,
    /// Maximum number of protections
    capacity: usize,
    /// Protections registered on the controller
    registered: Mutex<HashSet<Uuid>>,
}

impl HttpBlocker {
    /// Create a remote blocker from its configuration
    ///
    /// # Arguments
    ///
    /// * `config` - Blocker configuration; `params.endpoint` is required,
    ///   `params.api_token` and `params.timeout_seconds` are optional
    ///
    /// # Returns
    ///
    /// * `Ok(HttpBlocker)` if the configuration is usable
    /// * `Err(BlockerError::InvalidConfiguration)` otherwise
    pub fn from_config(config: &BlockerConfig) -> Result<Self, BlockerError> {
        let endpoint = config
            .params
            .get("endpoint")
            .ok_or_else(|| {
                BlockerError::InvalidConfiguration(format!("blocker {} requires params.endpoint", config.id))
            })?
            .trim_end_matches('/')
            .to_string();
        let timeout = match config.params.get("timeout_seconds") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                BlockerError::InvalidConfiguration(format!("invalid timeout_seconds: {}", raw))
            })?,
            None => DEFAULT_TIMEOUT_SECONDS,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| BlockerError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            id: config.id.clone(),
            client,
            endpoint,
            api_token: config.params.get("api_token").cloned(),
            capacity: config.capacity,
            registered: Mutex::new(HashSet::new()),
        })
    }

    fn protection_url(&self, id: Uuid, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{}/protections/{}/{}", self.endpoint, id, action),
            None => format!("{}/protections/{}", self.endpoint, id),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        match &self.api_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<StatusCode, BlockerError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| BlockerError::Backend(format!("{}: {}", self.id, e)))?;
        Ok(response.status())
    }

    /// Take a capacity slot for a protection before talking to the controller
    fn reserve(&self, id: Uuid, scope_instance_id: ScopeInstanceId) -> Result<(), BlockerError> {
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| BlockerError::Backend(format!("{}: protection table poisoned", self.id)))?;
        if registered.len() >= self.capacity {
            return Err(BlockerError::NoBlockerAvailable(scope_instance_id));
        }
        registered.insert(id);
        Ok(())
    }

    fn track(&self, f: impl FnOnce(&mut HashSet<Uuid>)) {
        match self.registered.lock() {
            Ok(mut registered) => f(&mut registered),
            Err(_) => warn!("[{}] protection table poisoned", self.id),
        }
    }
}

fn expect_success(blocker: &str, operation: &str, status: StatusCode) -> Result<(), BlockerError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(BlockerError::Backend(format!(
            "{}: {} rejected with status {}",
            blocker, operation, status
        )))
    }
}

#[async_trait]
impl Blocker for HttpBlocker {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "http"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn load(&self) -> usize {
        self.registered.lock().map(|r| r.len()).unwrap_or(0)
    }

    async fn register_protection(&self, scope: &MitigationScope) -> Result<Protection, BlockerError> {
        let protection = Protection::new(scope, &self.id);
        self.reserve(protection.id(), scope.scope_instance_id)?;
        let payload = ProtectionPayload::new(&protection, scope);
        let url = format!("{}/protections", self.endpoint);
        debug!("[{}] POST {}", self.id, url);

        let registered = match self.send(self.client.post(url).json(&payload)).await {
            Ok(status) => expect_success(&self.id, "register", status),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            self.track(|registered| {
                registered.remove(&protection.id());
            });
            return Err(e);
        }
        Ok(protection)
    }

    async fn execute_protection(&self, protection: &mut Protection) -> Result<(), BlockerError> {
        let url = self.protection_url(protection.id(), Some("start"));
        let status = self.send(self.client.post(url)).await?;
        expect_success(&self.id, "execute", status)?;
        protection.mark_started(Utc::now());
        Ok(())
    }

    async fn unregister_protection(&self, protection: &Protection) -> Result<(), BlockerError> {
        let url = self.protection_url(protection.id(), None);
        let status = self.send(self.client.delete(url)).await?;
        self.track(|registered| {
            registered.remove(&protection.id());
        });
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(&self.id, "unregister", status)
    }

    async fn stop_protection(&self, protection: &mut Protection) -> Result<(), BlockerError> {
        let url = self.protection_url(protection.id(), Some("stop"));
        let status = self.send(self.client.post(url)).await?;
        // 404 means the controller already dropped it
        if status != StatusCode::NOT_FOUND {
            expect_success(&self.id, "stop", status)?;
        }
        self.track(|registered| {
            registered.remove(&protection.id());
        });
        protection.mark_stopped(Utc::now());
        Ok(())
    }
}
