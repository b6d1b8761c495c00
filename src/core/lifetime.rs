//! Lifetime tracking for active mitigations.
//!
//! [`ActiveMitigationRegistry`] is the single owner of the in-memory set of
//! live scope instances and of the queue of terminated instances waiting to
//! be reaped. The engine and the [`LifetimeSweeper`] share it by `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::core::engine::MitigationEngine;
use crate::core::scope::{MitigationScope, ScopeInstanceId, INDEFINITE_LIFETIME};
use crate::core::store::{MitigationScopeStore, StoreError};
use crate::utils::elapsed_seconds;

/// Lifetime bookkeeping for one live scope instance
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveMitigationEntry {
    pub scope_instance_id: ScopeInstanceId,
    pub lifetime: i64,
    pub last_modified_at: DateTime<Utc>,
}

impl ActiveMitigationEntry {
    pub fn from_scope(scope: &MitigationScope) -> Self {
        Self {
            scope_instance_id: scope.scope_instance_id,
            lifetime: scope.lifetime,
            last_modified_at: scope.last_modified_at,
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> i64 {
        self.lifetime - elapsed_seconds(self.last_modified_at, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lifetime != INDEFINITE_LIFETIME && self.remaining(now) <= 0
    }
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<ScopeInstanceId, ActiveMitigationEntry>,
    pending_reap: BTreeSet<ScopeInstanceId>,
    closed: bool,
}

/// Mutex-guarded registry of live and to-be-reaped scope instances
#[derive(Default)]
pub struct ActiveMitigationRegistry {
    state: Mutex<RegistryState>,
}

impl ActiveMitigationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from the store.
    ///
    /// Every non-terminated scope is tracked; terminated leftovers from a
    /// previous run are queued for reaping. Returns the number of tracked scopes.
    pub async fn init(&self, store: &dyn MitigationScopeStore) -> Result<usize, StoreError> {
        let active = store.get_all_active().await?;
        let terminated = store.get_all_terminated().await?;

        let mut state = self.state.lock().await;
        state.closed = false;
        for scope in &active {
            state
                .active
                .insert(scope.scope_instance_id, ActiveMitigationEntry::from_scope(scope));
        }
        for scope in &terminated {
            state.pending_reap.insert(scope.scope_instance_id);
        }
        info!(
            "Lifetime registry initialized: {} active, {} awaiting reap",
            active.len(),
            terminated.len()
        );
        Ok(state.active.len())
    }

    /// Track a scope or refresh its lifetime
    pub async fn upsert(&self, scope: &MitigationScope) {
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("Registry closed, not tracking scope instance {}", scope.scope_instance_id);
            return;
        }
        state
            .active
            .insert(scope.scope_instance_id, ActiveMitigationEntry::from_scope(scope));
    }

    pub async fn remove(&self, id: ScopeInstanceId) -> bool {
        self.state.lock().await.active.remove(&id).is_some()
    }

    pub async fn get(&self, id: ScopeInstanceId) -> Option<ActiveMitigationEntry> {
        self.state.lock().await.active.get(&id).cloned()
    }

    /// Ids of tracked scopes whose lifetime has run out
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<ScopeInstanceId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ScopeInstanceId> = state
            .active
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.scope_instance_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn schedule_reap(&self, id: ScopeInstanceId) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.pending_reap.insert(id);
        }
    }

    pub async fn pending_reaps(&self) -> Vec<ScopeInstanceId> {
        self.state.lock().await.pending_reap.iter().copied().collect()
    }

    pub async fn reap_done(&self, id: ScopeInstanceId) {
        self.state.lock().await.pending_reap.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop all tracking state and refuse further registrations until `init`
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.active.clear();
        state.pending_reap.clear();
        state.closed = true;
        info!("Lifetime registry shut down");
    }
}

/// Counts of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub terminated: usize,
    pub reaped: usize,
}

/// Background loop driving expired scopes to Terminated and reaping them
pub struct LifetimeSweeper {
    engine: Arc<MitigationEngine>,
    interval: Duration,
}

impl LifetimeSweeper {
    pub fn new(engine: Arc<MitigationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle { shutdown_tx, join }
    }

    /// Run until the shutdown flag flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting lifetime sweeper (interval {:?})", self.interval);
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep_once(Utc::now()).await;
                    if report != SweepReport::default() {
                        info!(
                            "Sweep terminated {} and reaped {} mitigations",
                            report.terminated, report.reaped
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Lifetime sweeper stopped");
    }

    /// One pass: terminate expired scopes, then reap everything pending.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let registry = self.engine.registry();

        let expired = registry.expired(now).await;
        debug!("Sweep tick: {} expired", expired.len());
        for id in expired {
            match self.engine.terminate(id).await {
                Ok(true) => report.terminated += 1,
                Ok(false) => debug!("Scope instance {} already gone", id),
                Err(e) => error!("Failed to terminate scope instance {}: {}", id, e),
            }
        }

        for id in registry.pending_reaps().await {
            match self.engine.reap(id).await {
                Ok(true) => report.reaped += 1,
                Ok(false) => {}
                Err(e) => warn!("Reap of scope instance {} deferred: {}", id, e),
            }
        }
        report
    }
}

/// Handle to a spawned sweeper
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Sweeper already stopped");
        }
        if let Err(e) = self.join.await {
            error!("Sweeper task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scope::{MitigationStatus, ScopeInput};
    use crate::core::store::InMemoryScopeStore;
    use chrono::Duration as ChronoDuration;

    fn scope(lifetime: i64) -> MitigationScope {
        let input = ScopeInput {
            mitigation_id: 1,
            target_prefix: vec!["192.0.2.0/24".to_string()],
            lifetime: Some(lifetime),
            ..Default::default()
        };
        MitigationScope::from_input(1, "c", None, &input, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_expired_respects_indefinite_lifetime() {
        let registry = ActiveMitigationRegistry::new();
        let mut short = scope(2);
        short.scope_instance_id = 1;
        let mut forever = scope(INDEFINITE_LIFETIME);
        forever.scope_instance_id = 2;
        registry.upsert(&short).await;
        registry.upsert(&forever).await;

        let now = Utc::now();
        assert!(registry.expired(now).await.is_empty());
        assert_eq!(registry.expired(now + ChronoDuration::seconds(2)).await, vec![1]);
        assert_eq!(registry.expired(now + ChronoDuration::days(1000)).await, vec![1]);
    }

    #[tokio::test]
    async fn test_upsert_refreshes_lifetime() {
        let registry = ActiveMitigationRegistry::new();
        let mut tracked = scope(5);
        tracked.scope_instance_id = 3;
        registry.upsert(&tracked).await;

        tracked.lifetime = 120;
        registry.upsert(&tracked).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(3).await.unwrap().lifetime, 120);
    }

    #[tokio::test]
    async fn test_init_seeds_active_and_pending_reaps() {
        let store = InMemoryScopeStore::new();
        let live = store.create(&scope(60)).await.unwrap();
        let dead = store.create(&scope(60)).await.unwrap();
        let mut terminated = store.get_by_instance(dead).await.unwrap().unwrap();
        terminated.status = MitigationStatus::Terminated;
        store.update(&terminated).await.unwrap();

        let registry = ActiveMitigationRegistry::new();
        assert_eq!(registry.init(&store).await.unwrap(), 1);
        assert!(registry.get(live).await.is_some());
        assert_eq!(registry.pending_reaps().await, vec![dead]);

        registry.reap_done(dead).await;
        assert!(registry.pending_reaps().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_entries() {
        let registry = ActiveMitigationRegistry::new();
        let mut tracked = scope(5);
        tracked.scope_instance_id = 1;
        registry.upsert(&tracked).await;
        registry.shutdown().await;
        assert!(registry.is_empty().await);

        registry.upsert(&tracked).await;
        registry.schedule_reap(1).await;
        assert!(registry.is_empty().await);
        assert!(registry.pending_reaps().await.is_empty());
    }
}
