//! Mitigation scope and protection persistence.
//!
//! The engine reads and writes scopes only through [`MitigationScopeStore`].
//! Transaction boundaries belong to the implementation; the engine assumes
//! its read-then-write sequences on one scope are serialized.
//! Protection handles live in a [`ProtectionStore`] keyed by scope instance
//! so a restarted process can still stop what an earlier one started.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::blocker::Protection;
use crate::core::scope::{
    CustomerId, MitigationScope, MitigationStatus, ScopeInstanceId, UNASSIGNED_SCOPE_INSTANCE,
};

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("scope instance {0} not found")]
    NotFound(ScopeInstanceId),
}

/// CRUD operations over persisted mitigation scopes
#[async_trait]
pub trait MitigationScopeStore: Send + Sync {
    /// Latest instance for the mitigation, or the given instance when `scope_instance_id` is set.
    async fn get(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: Option<ScopeInstanceId>,
    ) -> Result<Option<MitigationScope>, StoreError>;

    async fn get_by_instance(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<MitigationScope>, StoreError>;

    /// Mitigation ids with at least one stored instance for the client.
    async fn get_all_ids(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
    ) -> Result<Vec<i64>, StoreError>;

    /// Every stored scope that is not Terminated, across all customers.
    async fn get_all_active(&self) -> Result<Vec<MitigationScope>, StoreError>;

    /// Every stored scope that is Terminated and waiting to be reaped.
    async fn get_all_terminated(&self) -> Result<Vec<MitigationScope>, StoreError>;

    /// Persist a new scope and return its assigned instance id.
    async fn create(&self, scope: &MitigationScope) -> Result<ScopeInstanceId, StoreError>;

    async fn update(&self, scope: &MitigationScope) -> Result<(), StoreError>;

    /// Remove the instance. Deleting a missing instance is not an error.
    async fn delete(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<(), StoreError>;
}

/// Persisted protection handles, one per scope instance
#[async_trait]
pub trait ProtectionStore: Send + Sync {
    async fn get_protection(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<Protection>, StoreError>;

    /// Insert or replace the protection of its scope instance.
    async fn save_protection(&self, protection: &Protection) -> Result<(), StoreError>;

    /// Deleting a missing protection is not an error.
    async fn delete_protection(&self, scope_instance_id: ScopeInstanceId) -> Result<(), StoreError>;
}

#[derive(Default)]
struct ScopeTable {
    next_id: ScopeInstanceId,
    scopes: BTreeMap<ScopeInstanceId, MitigationScope>,
}

/// In-process scope store
#[derive(Default)]
pub struct InMemoryScopeStore {
    table: RwLock<ScopeTable>,
}

impl InMemoryScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.scopes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MitigationScopeStore for InMemoryScopeStore {
    async fn get(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: Option<ScopeInstanceId>,
    ) -> Result<Option<MitigationScope>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .scopes
            .values()
            .rev()
            .find(|s| {
                s.customer_id == customer_id
                    && s.client_identifier == client_identifier
                    && s.mitigation_id == mitigation_id
                    && scope_instance_id.map_or(true, |id| id == s.scope_instance_id)
            })
            .cloned())
    }

    async fn get_by_instance(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<MitigationScope>, StoreError> {
        let table = self.table.read().await;
        Ok(table.scopes.get(&scope_instance_id).cloned())
    }

    async fn get_all_ids(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let table = self.table.read().await;
        let mut ids: Vec<i64> = table
            .scopes
            .values()
            .filter(|s| s.customer_id == customer_id && s.client_identifier == client_identifier)
            .map(|s| s.mitigation_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn get_all_active(&self) -> Result<Vec<MitigationScope>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .scopes
            .values()
            .filter(|s| s.status != MitigationStatus::Terminated)
            .cloned()
            .collect())
    }

    async fn get_all_terminated(&self) -> Result<Vec<MitigationScope>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .scopes
            .values()
            .filter(|s| s.status == MitigationStatus::Terminated)
            .cloned()
            .collect())
    }

    async fn create(&self, scope: &MitigationScope) -> Result<ScopeInstanceId, StoreError> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let id = table.next_id;
        let mut stored = scope.clone();
        stored.scope_instance_id = id;
        table.scopes.insert(id, stored);
        Ok(id)
    }

    async fn update(&self, scope: &MitigationScope) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        match table.scopes.get_mut(&scope.scope_instance_id) {
            Some(stored) if scope.scope_instance_id != UNASSIGNED_SCOPE_INSTANCE => {
                *stored = scope.clone();
                Ok(())
            }
            _ => Err(StoreError::NotFound(scope.scope_instance_id)),
        }
    }

    async fn delete(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let matches = table.scopes.get(&scope_instance_id).map_or(false, |s| {
            s.customer_id == customer_id
                && s.client_identifier == client_identifier
                && s.mitigation_id == mitigation_id
        });
        if matches {
            table.scopes.remove(&scope_instance_id);
        }
        Ok(())
    }
}

/// In-process protection store
#[derive(Default)]
pub struct InMemoryProtectionStore {
    protections: RwLock<HashMap<ScopeInstanceId, Protection>>,
}

impl InMemoryProtectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtectionStore for InMemoryProtectionStore {
    async fn get_protection(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<Protection>, StoreError> {
        Ok(self.protections.read().await.get(&scope_instance_id).cloned())
    }

    async fn save_protection(&self, protection: &Protection) -> Result<(), StoreError> {
        self.protections
            .write()
            .await
            .insert(protection.scope_instance_id(), protection.clone());
        Ok(())
    }

    async fn delete_protection(&self, scope_instance_id: ScopeInstanceId) -> Result<(), StoreError> {
        self.protections.write().await.remove(&scope_instance_id);
        Ok(())
    }
}
