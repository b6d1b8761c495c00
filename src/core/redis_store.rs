//! Redis-backed scope, protection and alias stores.
//!
//! Scopes are stored as JSON documents under `dots:scope:{id}` with index
//! sets per mitigation and per client, and a global set of all instance ids.
//! Instance ids come from `INCR dots:scope:next_id`. Protections are JSON
//! documents under `dots:protection:{scope instance id}`. Aliases live in one
//! hash per client, keyed by alias name.
//!
//! Every store shares one multiplexed [`ConnectionManager`], which reconnects
//! on its own after a dropped connection.

use async_trait::async_trait;
use log::debug;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::core::alias::{Alias, AliasStore};
use crate::core::blocker::Protection;
use crate::core::scope::{CustomerId, MitigationScope, MitigationStatus, ScopeInstanceId};
use crate::core::store::{MitigationScopeStore, ProtectionStore, StoreError};
use crate::utils::format_store_key;

const SCOPE_PREFIX: &str = "dots:scope";
const NEXT_ID_KEY: &str = "dots:scope:next_id";
const ALL_SCOPES_KEY: &str = "dots:scopes:all";
const MITIGATION_INDEX_PREFIX: &str = "dots:scopes";
const CLIENT_MIDS_PREFIX: &str = "dots:mids";
const ALIAS_PREFIX: &str = "dots:alias";
const PROTECTION_PREFIX: &str = "dots:protection";

fn scope_key(id: ScopeInstanceId) -> String {
    format_store_key(SCOPE_PREFIX, &id.to_string())
}

fn mitigation_index_key(customer_id: CustomerId, client_identifier: &str, mitigation_id: i64) -> String {
    format_store_key(
        MITIGATION_INDEX_PREFIX,
        &format!("{}:{}:{}", customer_id, client_identifier, mitigation_id),
    )
}

fn client_mids_key(customer_id: CustomerId, client_identifier: &str) -> String {
    format_store_key(CLIENT_MIDS_PREFIX, &format!("{}:{}", customer_id, client_identifier))
}

fn protection_key(id: ScopeInstanceId) -> String {
    format_store_key(PROTECTION_PREFIX, &id.to_string())
}

fn alias_key(customer_id: CustomerId, client_identifier: &str) -> String {
    format_store_key(ALIAS_PREFIX, &format!("{}:{}", customer_id, client_identifier))
}

/// Scope store backed by Redis
pub struct RedisScopeStore {
    redis: ConnectionManager,
}

impl RedisScopeStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn load_many(
        &self,
        conn: &mut ConnectionManager,
        ids: &[ScopeInstanceId],
    ) -> Result<Vec<MitigationScope>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| scope_key(*id)).collect();
        let docs: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(conn).await?;
        docs.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn load_by_status(
        &self,
        predicate: impl Fn(MitigationStatus) -> bool + Send,
    ) -> Result<Vec<MitigationScope>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<ScopeInstanceId> = conn.smembers(ALL_SCOPES_KEY).await?;
        let scopes = self.load_many(&mut conn, &ids).await?;
        Ok(scopes.into_iter().filter(|s| predicate(s.status)).collect())
    }
}

#[async_trait]
impl MitigationScopeStore for RedisScopeStore {
    async fn get(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: Option<ScopeInstanceId>,
    ) -> Result<Option<MitigationScope>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<ScopeInstanceId> = conn
            .smembers(mitigation_index_key(customer_id, client_identifier, mitigation_id))
            .await?;
        let wanted = match scope_instance_id {
            Some(id) => ids.into_iter().find(|candidate| *candidate == id),
            None => ids.into_iter().max(),
        };
        match wanted {
            Some(id) => {
                let scope: Option<MitigationScope> = conn.get(scope_key(id)).await?;
                Ok(scope)
            }
            None => Ok(None),
        }
    }

    async fn get_by_instance(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<MitigationScope>, StoreError> {
        let mut conn = self.redis.clone();
        let scope: Option<MitigationScope> = conn.get(scope_key(scope_instance_id)).await?;
        Ok(scope)
    }

    async fn get_all_ids(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<i64> = conn.smembers(client_mids_key(customer_id, client_identifier)).await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get_all_active(&self) -> Result<Vec<MitigationScope>, StoreError> {
        self.load_by_status(|status| status != MitigationStatus::Terminated).await
    }

    async fn get_all_terminated(&self) -> Result<Vec<MitigationScope>, StoreError> {
        self.load_by_status(|status| status == MitigationStatus::Terminated).await
    }

    async fn create(&self, scope: &MitigationScope) -> Result<ScopeInstanceId, StoreError> {
        let mut conn = self.redis.clone();
        let id: ScopeInstanceId = conn.incr(NEXT_ID_KEY, 1).await?;

        let mut stored = scope.clone();
        stored.scope_instance_id = id;
        let json = serde_json::to_string(&stored)?;

        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(scope_key(id))
            .arg(json)
            .cmd("SADD")
            .arg(ALL_SCOPES_KEY)
            .arg(id)
            .cmd("SADD")
            .arg(mitigation_index_key(stored.customer_id, &stored.client_identifier, stored.mitigation_id))
            .arg(id)
            .cmd("SADD")
            .arg(client_mids_key(stored.customer_id, &stored.client_identifier))
            .arg(stored.mitigation_id)
            .query_async(&mut conn)
            .await?;

        debug!("Stored mitigation scope instance {}", id);
        Ok(id)
    }

    async fn update(&self, scope: &MitigationScope) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(scope_key(scope.scope_instance_id)).await?;
        if !exists {
            return Err(StoreError::NotFound(scope.scope_instance_id));
        }
        let json = serde_json::to_string(scope)?;
        let _: () = conn.set(scope_key(scope.scope_instance_id), json).await?;
        Ok(())
    }

    async fn delete(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let index_key = mitigation_index_key(customer_id, client_identifier, mitigation_id);

        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(scope_key(scope_instance_id))
            .cmd("SREM")
            .arg(ALL_SCOPES_KEY)
            .arg(scope_instance_id)
            .cmd("SREM")
            .arg(&index_key)
            .arg(scope_instance_id)
            .query_async(&mut conn)
            .await?;

        let remaining: usize = conn.scard(&index_key).await?;
        if remaining == 0 {
            let _: () = conn
                .srem(client_mids_key(customer_id, client_identifier), mitigation_id)
                .await?;
        }
        Ok(())
    }
}

/// Protection store backed by Redis
pub struct RedisProtectionStore {
    redis: ConnectionManager,
}

impl RedisProtectionStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ProtectionStore for RedisProtectionStore {
    async fn get_protection(
        &self,
        scope_instance_id: ScopeInstanceId,
    ) -> Result<Option<Protection>, StoreError> {
        let mut conn = self.redis.clone();
        let protection: Option<Protection> = conn.get(protection_key(scope_instance_id)).await?;
        Ok(protection)
    }

    async fn save_protection(&self, protection: &Protection) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(protection)?;
        let _: () = conn
            .set(protection_key(protection.scope_instance_id()), json)
            .await?;
        Ok(())
    }

    async fn delete_protection(&self, scope_instance_id: ScopeInstanceId) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(protection_key(scope_instance_id)).await?;
        Ok(())
    }
}

/// Alias store backed by Redis hashes
pub struct RedisAliasStore {
    redis: ConnectionManager,
}

impl RedisAliasStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn put_alias(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        alias: &Alias,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(alias)?;
        let _: () = conn
            .hset(alias_key(customer_id, client_identifier), &alias.name, json)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AliasStore for RedisAliasStore {
    async fn get_alias(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        name: &str,
    ) -> Result<Option<Alias>, StoreError> {
        let mut conn = self.redis.clone();
        let alias: Option<Alias> = conn.hget(alias_key(customer_id, client_identifier), name).await?;
        Ok(alias)
    }
}
