//! Alias lookup.
//!
//! Aliases are named bundles of target criteria managed through a separate
//! configuration channel. The engine only reads them when expanding a scope.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::scope::{CustomerId, MitigationScope};
use crate::core::store::StoreError;
use crate::core::target::TargetSpec;

/// A named, pre-validated bundle of target criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub targets: TargetSpec,
}

impl redis::FromRedisValue for Alias {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value)
            .map_err(|e| redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse Alias from JSON",
                e.to_string(),
            )))
    }
}

/// Read access to the alias configuration store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AliasStore: Send + Sync {
    /// Fetch an alias owned by the given client, if present.
    async fn get_alias(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        name: &str,
    ) -> Result<Option<Alias>, StoreError>;
}

/// Errors raised while expanding a scope's alias references
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("alias not found: {0}")]
    AliasNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fetch every alias a scope references, failing on the first missing one.
pub async fn resolve_aliases(
    store: &dyn AliasStore,
    scope: &MitigationScope,
) -> Result<Vec<Alias>, ResolveError> {
    let mut aliases = Vec::with_capacity(scope.targets.alias_names.len());
    for name in &scope.targets.alias_names {
        let alias = store
            .get_alias(scope.customer_id, &scope.client_identifier, name)
            .await?
            .ok_or_else(|| ResolveError::AliasNotFound(name.clone()))?;
        aliases.push(alias);
    }
    Ok(aliases)
}

/// In-process alias store
#[derive(Default)]
pub struct InMemoryAliasStore {
    aliases: RwLock<HashMap<(CustomerId, String, String), Alias>>,
}

impl InMemoryAliasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_alias(&self, customer_id: CustomerId, client_identifier: &str, alias: Alias) {
        let mut aliases = self.aliases.write().await;
        aliases.insert(
            (customer_id, client_identifier.to_string(), alias.name.clone()),
            alias,
        );
    }

    pub async fn remove_alias(&self, customer_id: CustomerId, client_identifier: &str, name: &str) -> bool {
        let mut aliases = self.aliases.write().await;
        aliases
            .remove(&(customer_id, client_identifier.to_string(), name.to_string()))
            .is_some()
    }
}

#[async_trait]
impl AliasStore for InMemoryAliasStore {
    async fn get_alias(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        name: &str,
    ) -> Result<Option<Alias>, StoreError> {
        let aliases = self.aliases.read().await;
        Ok(aliases
            .get(&(customer_id, client_identifier.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scope::ScopeInput;
    use crate::core::target::parse_prefix;
    use chrono::Utc;
    use mockall::predicate::eq;

    fn scope_with_aliases(names: &[&str]) -> MitigationScope {
        let input = ScopeInput {
            mitigation_id: 1,
            alias_name: names.iter().map(|n| n.to_string()).collect(),
            lifetime: Some(60),
            ..Default::default()
        };
        MitigationScope::from_input(1, "client-a", None, &input, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_alias_store_is_scoped_per_client() {
        let store = InMemoryAliasStore::new();
        let alias = Alias {
            name: "web".to_string(),
            targets: TargetSpec {
                prefixes: vec![parse_prefix("192.0.2.0/24").unwrap()],
                ..Default::default()
            },
        };
        store.put_alias(1, "client-a", alias.clone()).await;

        assert_eq!(store.get_alias(1, "client-a", "web").await.unwrap(), Some(alias));
        assert_eq!(store.get_alias(1, "client-b", "web").await.unwrap(), None);
        assert_eq!(store.get_alias(2, "client-a", "web").await.unwrap(), None);

        assert!(store.remove_alias(1, "client-a", "web").await);
        assert_eq!(store.get_alias(1, "client-a", "web").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_aliases_fails_on_missing_alias() {
        let mut store = MockAliasStore::new();
        store
            .expect_get_alias()
            .with(eq(1), eq("client-a"), eq("known"))
            .returning(|_, _, name| {
                Ok(Some(Alias {
                    name: name.to_string(),
                    targets: TargetSpec::default(),
                }))
            });
        store
            .expect_get_alias()
            .with(eq(1), eq("client-a"), eq("unknown"))
            .returning(|_, _, _| Ok(None));

        let resolved = resolve_aliases(&store, &scope_with_aliases(&["known"])).await.unwrap();
        assert_eq!(resolved.len(), 1);

        let err = resolve_aliases(&store, &scope_with_aliases(&["known", "unknown"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AliasNotFound(name) if name == "unknown"));
    }
}
