//! Mitigation scope model.
//!
//! A `MitigationScope` is one persisted mitigation request instance. Its
//! identity is (customer, client identifier, mitigation id, scope instance id);
//! the scope instance id is assigned by the store and disambiguates
//! successive requests that reuse a mitigation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::target::{PortRangeInput, TargetError, TargetSpec};
use crate::utils::elapsed_seconds;

pub type CustomerId = i64;
pub type ScopeInstanceId = i64;

/// Lifetime value meaning "never expires"
pub const INDEFINITE_LIFETIME: i64 = -1;

/// Scope instance id of a scope that has not been persisted yet
pub const UNASSIGNED_SCOPE_INSTANCE: ScopeInstanceId = 0;

/// Errors raised when constructing a scope
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScopeError {
    #[error("client identifier must not be empty")]
    MissingClientIdentifier,
    #[error("mitigation id must be positive, got {0}")]
    InvalidMitigationId(i64),
    #[error("lifetime is required")]
    MissingLifetime,
    #[error("invalid lifetime value: {0}")]
    InvalidLifetime(i64),
    #[error("invalid attack status value: {0}")]
    InvalidAttackStatus(i64),
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Mitigation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MitigationStatus {
    Active,
    ActiveButTerminating,
    Terminated,
}

impl MitigationStatus {
    /// Numeric status code reported to clients
    pub fn code(self) -> u8 {
        match self {
            MitigationStatus::Active => 2,
            MitigationStatus::ActiveButTerminating => 5,
            MitigationStatus::Terminated => 6,
        }
    }
}

/// Attack status reported by efficacy updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackStatus {
    UnderAttack,
    AttackSuccessfullyMitigated,
}

impl AttackStatus {
    pub fn code(self) -> u8 {
        match self {
            AttackStatus::UnderAttack => 1,
            AttackStatus::AttackSuccessfullyMitigated => 2,
        }
    }
}

impl TryFrom<i64> for AttackStatus {
    type Error = ScopeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AttackStatus::UnderAttack),
            2 => Ok(AttackStatus::AttackSuccessfullyMitigated),
            other => Err(ScopeError::InvalidAttackStatus(other)),
        }
    }
}

/// One scope of a mitigation request body, as decoded by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScopeInput {
    #[serde(default)]
    pub mitigation_id: i64,
    #[serde(default)]
    pub target_prefix: Vec<String>,
    #[serde(default)]
    pub target_port_range: Vec<PortRangeInput>,
    #[serde(default)]
    pub target_protocol: Vec<i64>,
    #[serde(default)]
    pub target_fqdn: Vec<String>,
    #[serde(default)]
    pub target_uri: Vec<String>,
    #[serde(default)]
    pub alias_name: Vec<String>,
    #[serde(default)]
    pub lifetime: Option<i64>,
    #[serde(default)]
    pub attack_status: Option<i64>,
}

impl ScopeInput {
    pub fn target_spec(&self) -> Result<TargetSpec, TargetError> {
        TargetSpec::parse(
            &self.target_prefix,
            &self.target_port_range,
            &self.target_protocol,
            &self.target_fqdn,
            &self.target_uri,
            &self.alias_name,
        )
    }
}

/// A create request: one client, one or more scopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRequest {
    pub client_identifier: String,
    #[serde(default)]
    pub client_domain_identifier: Option<String>,
    pub scopes: Vec<ScopeInput>,
}

/// A persisted mitigation request instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationScope {
    pub scope_instance_id: ScopeInstanceId,
    pub customer_id: CustomerId,
    pub client_identifier: String,
    pub client_domain_identifier: Option<String>,
    pub mitigation_id: i64,
    pub targets: TargetSpec,
    pub lifetime: i64,
    pub status: MitigationStatus,
    pub attack_status: Option<AttackStatus>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl MitigationScope {
    /// Build a new, not yet persisted, active scope from a request body.
    pub fn from_input(
        customer_id: CustomerId,
        client_identifier: &str,
        client_domain_identifier: Option<String>,
        input: &ScopeInput,
        now: DateTime<Utc>,
    ) -> Result<Self, ScopeError> {
        if client_identifier.is_empty() {
            return Err(ScopeError::MissingClientIdentifier);
        }
        if input.mitigation_id <= 0 {
            return Err(ScopeError::InvalidMitigationId(input.mitigation_id));
        }
        let lifetime = input.lifetime.ok_or(ScopeError::MissingLifetime)?;
        if lifetime <= 0 && lifetime != INDEFINITE_LIFETIME {
            return Err(ScopeError::InvalidLifetime(lifetime));
        }
        let attack_status = input.attack_status.map(AttackStatus::try_from).transpose()?;
        let targets = input.target_spec()?;
        targets.validate_for_activation()?;

        Ok(Self {
            scope_instance_id: UNASSIGNED_SCOPE_INSTANCE,
            customer_id,
            client_identifier: client_identifier.to_string(),
            client_domain_identifier,
            mitigation_id: input.mitigation_id,
            targets,
            lifetime,
            status: MitigationStatus::Active,
            attack_status,
            created_at: now,
            last_modified_at: now,
        })
    }

    pub fn is_indefinite(&self) -> bool {
        self.lifetime == INDEFINITE_LIFETIME
    }

    /// Seconds left before expiry, or the indefinite sentinel.
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> i64 {
        if self.is_indefinite() {
            return INDEFINITE_LIFETIME;
        }
        (self.lifetime - elapsed_seconds(self.last_modified_at, now)).max(0)
    }

    /// Active or terminating, and not an expired tombstone awaiting the sweeper.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status != MitigationStatus::Terminated && self.remaining_lifetime(now) != 0
    }

    pub fn same_owner(&self, other: &MitigationScope) -> bool {
        self.customer_id == other.customer_id && self.client_identifier == other.client_identifier
    }

    pub fn same_mitigation(&self, other: &MitigationScope) -> bool {
        self.same_owner(other) && self.mitigation_id == other.mitigation_id
    }
}

impl redis::FromRedisValue for MitigationScope {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value)
            .map_err(|e| redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse MitigationScope from JSON",
                e.to_string(),
            )))
    }
}

/// Why a request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictCause {
    OverlappingTargets,
    CuidCollision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStatus {
    Rejected,
}

/// The existing mitigation a request collided with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConflictScope {
    pub mitigation_id: i64,
    pub client_identifier: String,
    pub alias_name: Vec<String>,
}

/// Structured conflict verdict returned to the client; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConflictInformation {
    pub conflict_status: ConflictStatus,
    pub conflict_cause: ConflictCause,
    pub conflict_scope: Option<ConflictScope>,
    pub retry_timer: Option<u64>,
}

impl ConflictInformation {
    pub fn rejected(cause: ConflictCause, scope: ConflictScope) -> Self {
        Self {
            conflict_status: ConflictStatus::Rejected,
            conflict_cause: cause,
            conflict_scope: Some(scope),
            retry_timer: None,
        }
    }
}

/// Read-only status view of one mitigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MitigationStatusSnapshot {
    pub mitigation_id: i64,
    pub scope_instance_id: ScopeInstanceId,
    pub client_domain_identifier: Option<String>,
    pub targets: TargetSpec,
    pub lifetime: i64,
    pub status: MitigationStatus,
    pub status_code: u8,
    pub attack_status: Option<AttackStatus>,
    pub mitigation_start: Option<DateTime<Utc>>,
}
