//! Mitigation orchestration engine.
//!
//! The engine drives mitigation scopes through their lifecycle:
//! `Active` -> `ActiveButTerminating` -> `Terminated` -> reaped. It ties
//! together alias resolution, conflict detection, blocker selection and
//! protection management, persistence and lifetime tracking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use metrics::increment_counter;
use thiserror::Error;

use crate::core::alias::{resolve_aliases, Alias, AliasStore, ResolveError};
use crate::core::blocker::{BlockerError, Protection};
use crate::core::conflict::{check_overlap, ResolvedScope};
use crate::core::lifetime::{ActiveMitigationRegistry, LifetimeSweeper, SweeperHandle};
use crate::core::scope::{
    AttackStatus, ConflictInformation, CustomerId, MitigationRequest, MitigationScope,
    MitigationStatus, MitigationStatusSnapshot, ScopeError, ScopeInput, ScopeInstanceId,
    UNASSIGNED_SCOPE_INSTANCE,
};
use crate::core::selection::SelectionService;
use crate::core::store::{MitigationScopeStore, ProtectionStore, StoreError};
use crate::core::target::{ResolvedTargets, TargetError};
use crate::models::LifetimeConfig;
use crate::utils::get_current_timestamp;

/// Errors surfaced by the orchestration engine
#[derive(Error, Debug)]
pub enum MitigationError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Alias not found: {0}")]
    AliasNotFound(String),
    #[error("Blocker error: {0}")]
    Blocker(#[from] BlockerError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Engine construction error: {0}")]
    Construction(String),
}

impl From<ScopeError> for MitigationError {
    fn from(e: ScopeError) -> Self {
        MitigationError::Validation(e.to_string())
    }
}

impl From<TargetError> for MitigationError {
    fn from(e: TargetError) -> Self {
        MitigationError::Validation(e.to_string())
    }
}

impl From<ResolveError> for MitigationError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::AliasNotFound(name) => MitigationError::AliasNotFound(name),
            ResolveError::Store(e) => MitigationError::Persistence(e),
        }
    }
}

/// Outcome of a PUT on a mitigation
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Created,
    Changed,
    Conflict(ConflictInformation),
}

/// A validated candidate and the aliases it references
struct Candidate {
    scope: MitigationScope,
    aliases: Vec<Alias>,
    is_new: bool,
}

/// Candidates that passed conflict detection
struct Accepted {
    candidates: Vec<Candidate>,
    overrides: Vec<ScopeInstanceId>,
}

enum Verdict {
    Accepted(Accepted),
    Rejected(ConflictInformation),
}

/// Record written before blocker registration, undone on failure
enum Persisted {
    Created(MitigationScope),
    Replaced(MitigationScope),
}

/// Builder validating that every collaborator is present
#[derive(Default)]
pub struct MitigationEngineBuilder {
    store: Option<Arc<dyn MitigationScopeStore>>,
    protection_store: Option<Arc<dyn ProtectionStore>>,
    alias_store: Option<Arc<dyn AliasStore>>,
    selection: Option<Arc<SelectionService>>,
    registry: Option<Arc<ActiveMitigationRegistry>>,
    lifetime: LifetimeConfig,
}

impl MitigationEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn MitigationScopeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn protection_store(mut self, protection_store: Arc<dyn ProtectionStore>) -> Self {
        self.protection_store = Some(protection_store);
        self
    }

    pub fn alias_store(mut self, alias_store: Arc<dyn AliasStore>) -> Self {
        self.alias_store = Some(alias_store);
        self
    }

    pub fn selection(mut self, selection: Arc<SelectionService>) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn registry(mut self, registry: Arc<ActiveMitigationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn lifetime(mut self, lifetime: LifetimeConfig) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn build(self) -> Result<Arc<MitigationEngine>, MitigationError> {
        let store = self
            .store
            .ok_or_else(|| MitigationError::Construction("a scope store is required".to_string()))?;
        let protections = self
            .protection_store
            .ok_or_else(|| MitigationError::Construction("a protection store is required".to_string()))?;
        let alias_store = self
            .alias_store
            .ok_or_else(|| MitigationError::Construction("an alias store is required".to_string()))?;
        let selection = self
            .selection
            .ok_or_else(|| MitigationError::Construction("a selection service is required".to_string()))?;
        if selection.pool().is_empty() {
            return Err(MitigationError::Construction(
                "at least one blocker must be configured".to_string(),
            ));
        }
        if self.lifetime.active_but_terminating_period <= 0
            || self.lifetime.max_active_but_terminating_period < self.lifetime.active_but_terminating_period
        {
            return Err(MitigationError::Construction(format!(
                "invalid active-but-terminating periods: {} / {}",
                self.lifetime.active_but_terminating_period, self.lifetime.max_active_but_terminating_period
            )));
        }

        Ok(Arc::new(MitigationEngine {
            store,
            alias_store,
            selection,
            registry: self.registry.unwrap_or_default(),
            protections,
            lifetime: self.lifetime,
        }))
    }
}

/// Orchestration engine
pub struct MitigationEngine {
    store: Arc<dyn MitigationScopeStore>,
    alias_store: Arc<dyn AliasStore>,
    selection: Arc<SelectionService>,
    registry: Arc<ActiveMitigationRegistry>,
    /// Protection handles keyed by scope instance
    protections: Arc<dyn ProtectionStore>,
    lifetime: LifetimeConfig,
}

impl MitigationEngine {
    pub fn builder() -> MitigationEngineBuilder {
        MitigationEngineBuilder::new()
    }

    pub fn registry(&self) -> &Arc<ActiveMitigationRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MitigationScopeStore> {
        &self.store
    }

    /// Persisted protection of a scope instance, if any
    pub async fn protection(&self, id: ScopeInstanceId) -> Result<Option<Protection>, StoreError> {
        self.protections.get_protection(id).await
    }

    /// Spawn the lifetime sweeper for this engine
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let interval = Duration::from_secs(self.lifetime.sweep_interval_seconds.max(1));
        LifetimeSweeper::new(self.clone(), interval).spawn()
    }

    /// Create or update a single mitigation, or apply an efficacy update
    /// when an If-Match marker is present.
    pub async fn put(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        client_domain_identifier: Option<String>,
        input: &ScopeInput,
        if_match: Option<&[u8]>,
    ) -> Result<PutOutcome, MitigationError> {
        if let Some(marker) = if_match {
            self.efficacy_update(customer_id, client_identifier, input.mitigation_id, input, marker)
                .await?;
            return Ok(PutOutcome::Changed);
        }

        let now = get_current_timestamp();
        let existing = self
            .store
            .get(customer_id, client_identifier, input.mitigation_id, None)
            .await?;
        if existing.map_or(false, |scope| scope.is_live(now)) {
            let conflict = self
                .update(customer_id, client_identifier, input.mitigation_id, input)
                .await?;
            return Ok(conflict.map_or(PutOutcome::Changed, PutOutcome::Conflict));
        }

        let request = MitigationRequest {
            client_identifier: client_identifier.to_string(),
            client_domain_identifier,
            scopes: vec![input.clone()],
        };
        let conflict = self.create(customer_id, &request).await?;
        Ok(conflict.map_or(PutOutcome::Created, PutOutcome::Conflict))
    }

    /// Create every scope of a request as one batch.
    ///
    /// Returns `Ok(Some(conflict))` when a hard conflict rejected the request.
    pub async fn create(
        &self,
        customer_id: CustomerId,
        request: &MitigationRequest,
    ) -> Result<Option<ConflictInformation>, MitigationError> {
        let now = get_current_timestamp();
        if request.scopes.is_empty() {
            return Err(MitigationError::Validation("request carries no scope".to_string()));
        }

        let mut seen = HashSet::new();
        let mut scopes = Vec::with_capacity(request.scopes.len());
        for input in &request.scopes {
            if !seen.insert(input.mitigation_id) {
                return Err(MitigationError::Validation(format!(
                    "mitigation id {} appears twice in the request",
                    input.mitigation_id
                )));
            }
            let scope = MitigationScope::from_input(
                customer_id,
                &request.client_identifier,
                request.client_domain_identifier.clone(),
                input,
                now,
            )?;
            if let Some(existing) = self
                .store
                .get(customer_id, &request.client_identifier, input.mitigation_id, None)
                .await?
            {
                if existing.is_live(now) {
                    return Err(MitigationError::Validation(format!(
                        "mitigation {} is already active",
                        input.mitigation_id
                    )));
                }
                if existing.status != MitigationStatus::Terminated {
                    // expired but not swept yet
                    self.terminate(existing.scope_instance_id).await?;
                }
            }
            scopes.push((scope, true));
        }

        let accepted = match self.check(scopes).await? {
            Verdict::Accepted(accepted) => accepted,
            Verdict::Rejected(conflict) => return Ok(Some(conflict)),
        };
        let created = self.activate(accepted).await?;
        for scope in &created {
            increment_counter!("dots_mitigations_created_total");
            info!(
                "Created mitigation {} for {} (scope instance {})",
                scope.mitigation_id, scope.client_identifier, scope.scope_instance_id
            );
        }
        Ok(None)
    }

    /// Replace an existing mitigation with a new body.
    ///
    /// Conflict detection runs before the old protection is torn down, so a
    /// rejected update leaves the old mitigation untouched. If the new
    /// protection then fails to start, the scope ends Terminated.
    pub async fn update(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        input: &ScopeInput,
    ) -> Result<Option<ConflictInformation>, MitigationError> {
        let now = get_current_timestamp();
        if input.mitigation_id != mitigation_id {
            return Err(MitigationError::Validation(format!(
                "body mitigation id {} does not match {}",
                input.mitigation_id, mitigation_id
            )));
        }
        let existing = match self
            .store
            .get(customer_id, client_identifier, mitigation_id, None)
            .await?
        {
            Some(scope) if scope.is_live(now) => scope,
            _ => {
                debug!("No live mitigation {} for {}, creating it", mitigation_id, client_identifier);
                let request = MitigationRequest {
                    client_identifier: client_identifier.to_string(),
                    client_domain_identifier: None,
                    scopes: vec![input.clone()],
                };
                return self.create(customer_id, &request).await;
            }
        };

        let mut candidate = MitigationScope::from_input(
            customer_id,
            client_identifier,
            existing.client_domain_identifier.clone(),
            input,
            now,
        )?;
        candidate.scope_instance_id = existing.scope_instance_id;
        candidate.created_at = existing.created_at;
        if existing.status == MitigationStatus::ActiveButTerminating {
            candidate.lifetime = self.lifetime.max_active_but_terminating_period;
        }

        let accepted = match self.check(vec![(candidate, false)]).await? {
            Verdict::Accepted(accepted) => accepted,
            Verdict::Rejected(conflict) => return Ok(Some(conflict)),
        };

        self.cancel_protection(existing.scope_instance_id).await?;
        self.activate(accepted).await?;

        increment_counter!("dots_mitigations_updated_total");
        info!(
            "Updated mitigation {} for {} (scope instance {})",
            mitigation_id, client_identifier, existing.scope_instance_id
        );
        Ok(None)
    }

    /// Record the attack status reported by the client.
    ///
    /// Skips alias resolution and conflict detection. Every target field of
    /// the body must match the stored scope; lifetime is not compared.
    pub async fn efficacy_update(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
        input: &ScopeInput,
        if_match: &[u8],
    ) -> Result<(), MitigationError> {
        if !if_match.is_empty() {
            return Err(MitigationError::Validation(
                "If-Match must be empty for an efficacy update".to_string(),
            ));
        }
        let code = input
            .attack_status
            .ok_or_else(|| MitigationError::Validation("attack-status is required".to_string()))?;
        let attack_status = AttackStatus::try_from(code)?;

        let mut scope = match self
            .store
            .get(customer_id, client_identifier, mitigation_id, None)
            .await?
        {
            Some(scope) if scope.status != MitigationStatus::Terminated => scope,
            _ => {
                debug!("Efficacy update for unknown mitigation {} ignored", mitigation_id);
                return Ok(());
            }
        };

        if input.target_spec()? != scope.targets {
            return Err(MitigationError::Validation(
                "efficacy update must not change the mitigation targets".to_string(),
            ));
        }

        scope.attack_status = Some(attack_status);
        self.store.update(&scope).await?;
        info!(
            "Mitigation {} of {} reports attack status {}",
            mitigation_id,
            client_identifier,
            attack_status.code()
        );
        Ok(())
    }

    /// Move an active mitigation into its grace period.
    ///
    /// Missing, terminating and terminated mitigations are left alone. An
    /// Active scope whose lifetime already ran out is terminated instead.
    pub async fn delete(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: i64,
    ) -> Result<(), MitigationError> {
        let now = get_current_timestamp();
        let mut scope = match self
            .store
            .get(customer_id, client_identifier, mitigation_id, None)
            .await?
        {
            Some(scope) if scope.status == MitigationStatus::Active => scope,
            Some(scope) => {
                debug!("Delete of mitigation {} ignored: {:?}", mitigation_id, scope.status);
                return Ok(());
            }
            None => return Ok(()),
        };
        if !scope.is_live(now) {
            debug!("Mitigation {} already expired, terminating it", mitigation_id);
            self.terminate(scope.scope_instance_id).await?;
            return Ok(());
        }

        scope.status = MitigationStatus::ActiveButTerminating;
        scope.lifetime = self.lifetime.active_but_terminating_period;
        scope.last_modified_at = now;
        self.store.update(&scope).await?;
        self.registry.upsert(&scope).await;

        info!(
            "Mitigation {} of {} is terminating in {}s",
            mitigation_id, client_identifier, scope.lifetime
        );
        Ok(())
    }

    /// Status of one mitigation, or of every mitigation of the client.
    ///
    /// Terminated scopes are queued for reaping and omitted.
    pub async fn get(
        &self,
        customer_id: CustomerId,
        client_identifier: &str,
        mitigation_id: Option<i64>,
    ) -> Result<Vec<MitigationStatusSnapshot>, MitigationError> {
        let now = get_current_timestamp();
        let mitigation_ids = match mitigation_id {
            Some(id) => vec![id],
            None => self.store.get_all_ids(customer_id, client_identifier).await?,
        };

        let mut snapshots = Vec::with_capacity(mitigation_ids.len());
        for id in mitigation_ids {
            let scope = match self.store.get(customer_id, client_identifier, id, None).await? {
                Some(scope) => scope,
                None => continue,
            };
            if scope.status == MitigationStatus::Terminated {
                self.registry.schedule_reap(scope.scope_instance_id).await;
                continue;
            }
            let remaining = scope.remaining_lifetime(now);
            if remaining == 0 {
                continue;
            }
            let mitigation_start = self
                .protections
                .get_protection(scope.scope_instance_id)
                .await?
                .and_then(|protection| protection.started_at());

            snapshots.push(MitigationStatusSnapshot {
                mitigation_id: scope.mitigation_id,
                scope_instance_id: scope.scope_instance_id,
                client_domain_identifier: scope.client_domain_identifier,
                targets: scope.targets,
                lifetime: remaining,
                status: scope.status,
                status_code: scope.status.code(),
                attack_status: scope.attack_status,
                mitigation_start,
            });
        }
        Ok(snapshots)
    }

    /// Mark a scope instance Terminated and queue it for reaping.
    ///
    /// Returns false when the instance was already gone or terminated.
    pub async fn terminate(&self, id: ScopeInstanceId) -> Result<bool, MitigationError> {
        let mut scope = match self.store.get_by_instance(id).await? {
            Some(scope) => scope,
            None => {
                self.registry.remove(id).await;
                return Ok(false);
            }
        };
        if scope.status == MitigationStatus::Terminated {
            self.registry.remove(id).await;
            self.registry.schedule_reap(id).await;
            return Ok(false);
        }

        scope.status = MitigationStatus::Terminated;
        scope.last_modified_at = get_current_timestamp();
        self.store.update(&scope).await?;
        self.registry.remove(id).await;
        self.registry.schedule_reap(id).await;

        increment_counter!("dots_mitigations_terminated_total");
        info!(
            "Terminated mitigation {} of {} (scope instance {})",
            scope.mitigation_id, scope.client_identifier, id
        );
        Ok(true)
    }

    /// Stop the protection of a Terminated scope and delete its record.
    ///
    /// A failing stop keeps the instance queued for the next sweep.
    pub async fn reap(&self, id: ScopeInstanceId) -> Result<bool, MitigationError> {
        let scope = match self.store.get_by_instance(id).await? {
            Some(scope) => scope,
            None => {
                self.protections.delete_protection(id).await?;
                self.registry.reap_done(id).await;
                return Ok(false);
            }
        };
        if scope.status != MitigationStatus::Terminated {
            self.registry.reap_done(id).await;
            return Ok(false);
        }

        self.cancel_protection(id).await?;
        self.store
            .delete(scope.customer_id, &scope.client_identifier, scope.mitigation_id, id)
            .await?;
        self.registry.reap_done(id).await;

        increment_counter!("dots_mitigations_reaped_total");
        info!("Reaped mitigation {} (scope instance {})", scope.mitigation_id, id);
        Ok(true)
    }

    /// Stop the persisted protection of a scope instance, if any.
    ///
    /// The protection record is dropped only once the blocker confirmed the
    /// stop, so a failed attempt can be retried later.
    async fn cancel_protection(&self, id: ScopeInstanceId) -> Result<(), MitigationError> {
        let mut protection = match self.protections.get_protection(id).await? {
            Some(protection) if protection.is_enabled() => protection,
            Some(_) => {
                self.protections.delete_protection(id).await?;
                return Ok(());
            }
            None => return Ok(()),
        };

        let result = match self.selection.blocker(protection.blocker_id()) {
            Some(blocker) => blocker.stop_protection(&mut protection).await,
            None => Err(BlockerError::Backend(format!(
                "blocker {} is not configured",
                protection.blocker_id()
            ))),
        };
        if let Err(e) = result {
            error!("Failed to stop protection {}: {}", protection.id(), e);
            return Err(e.into());
        }
        self.protections.delete_protection(id).await?;
        debug!("Stopped protection {} of scope instance {}", protection.id(), id);
        Ok(())
    }

    /// Every live scope with its aliases expanded
    async fn live_scopes(&self) -> Result<Vec<ResolvedScope>, MitigationError> {
        let now = get_current_timestamp();
        let mut live = Vec::new();
        for scope in self.store.get_all_active().await? {
            if !scope.is_live(now) {
                continue;
            }
            let aliases = match resolve_aliases(self.alias_store.as_ref(), &scope).await {
                Ok(aliases) => aliases,
                Err(ResolveError::AliasNotFound(name)) => {
                    warn!(
                        "Alias {} of mitigation {} vanished, comparing direct targets only",
                        name, scope.mitigation_id
                    );
                    Vec::new()
                }
                Err(ResolveError::Store(e)) => return Err(e.into()),
            };
            let targets = ResolvedTargets::new(&scope.targets, &aliases);
            live.push(ResolvedScope::new(scope, targets));
        }
        Ok(live)
    }

    /// Resolve aliases and run conflict detection for a set of candidates
    async fn check(&self, scopes: Vec<(MitigationScope, bool)>) -> Result<Verdict, MitigationError> {
        let now = get_current_timestamp();
        let live = self.live_scopes().await?;

        let mut candidates = Vec::with_capacity(scopes.len());
        let mut overrides: Vec<ScopeInstanceId> = Vec::new();
        for (scope, is_new) in scopes {
            let aliases = resolve_aliases(self.alias_store.as_ref(), &scope).await?;
            let targets = ResolvedTargets::new(&scope.targets, &aliases);
            let resolved = ResolvedScope::new(scope, targets);
            let outcome = check_overlap(&resolved, &live, is_new, now);

            if let Some(mut conflict) = outcome.conflict {
                conflict.retry_timer = Some(self.lifetime.conflict_retry_timer);
                increment_counter!("dots_conflicts_total");
                info!(
                    "Mitigation {} of {} rejected: {:?}",
                    resolved.scope.mitigation_id, resolved.scope.client_identifier, conflict.conflict_cause
                );
                return Ok(Verdict::Rejected(conflict));
            }
            for id in outcome.overrides {
                if !overrides.contains(&id) {
                    overrides.push(id);
                }
            }
            candidates.push(Candidate {
                scope: resolved.scope,
                aliases,
                is_new,
            });
        }
        Ok(Verdict::Accepted(Accepted { candidates, overrides }))
    }

    /// Persist the candidates, start their protections and retire overrides.
    ///
    /// Any blocker failure unregisters every protection of the batch and
    /// undoes the speculative records.
    async fn activate(&self, accepted: Accepted) -> Result<Vec<MitigationScope>, MitigationError> {
        let Accepted { candidates, overrides } = accepted;

        let mut persisted = Vec::with_capacity(candidates.len());
        let mut expanded = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut scope = candidate.scope;
            let record = if candidate.is_new || scope.scope_instance_id == UNASSIGNED_SCOPE_INSTANCE {
                match self.store.create(&scope).await {
                    Ok(id) => {
                        scope.scope_instance_id = id;
                        Some(Persisted::Created(scope.clone()))
                    }
                    Err(e) => {
                        self.rollback(&[], &persisted).await;
                        return Err(e.into());
                    }
                }
            } else {
                persisted.push(Persisted::Replaced(scope.clone()));
                if let Err(e) = self.store.update(&scope).await {
                    self.rollback(&[], &persisted).await;
                    return Err(e.into());
                }
                None
            };
            if let Some(record) = record {
                persisted.push(record);
            }

            let mut blocker_scope = scope;
            blocker_scope.targets = blocker_scope.targets.expanded_with(&candidate.aliases);
            expanded.push(blocker_scope);
        }

        let mut batch = match self.selection.select_all(expanded).await {
            Ok(batch) => batch,
            Err(e) => {
                self.rollback(&[], &persisted).await;
                return Err(e.into());
            }
        };

        let mut registered: Vec<Protection> = Vec::new();
        let mut failure: Option<BlockerError> = None;
        while let Some(message) = batch.next().await {
            let selected = match message {
                Ok(selected) => selected,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };
            if failure.is_some() {
                continue;
            }
            match selected.blocker.register_protection(&selected.scope).await {
                Ok(mut protection) => {
                    let started = selected.blocker.execute_protection(&mut protection).await;
                    registered.push(protection);
                    if let Err(e) = started {
                        failure = Some(e);
                    }
                }
                Err(e) => failure = Some(e),
            }
        }

        if let Some(e) = failure {
            error!("Blocker failure, rolling back {} mitigations: {}", persisted.len(), e);
            self.rollback(&registered, &persisted).await;
            return Err(e.into());
        }

        for protection in &registered {
            if let Err(e) = self.protections.save_protection(protection).await {
                error!("Failed to persist protection {}, rolling back: {}", protection.id(), e);
                self.rollback(&registered, &persisted).await;
                return Err(e.into());
            }
        }

        let mut activated = Vec::with_capacity(persisted.len());
        for record in persisted {
            let scope = match record {
                Persisted::Created(scope) | Persisted::Replaced(scope) => scope,
            };
            self.registry.upsert(&scope).await;
            activated.push(scope);
        }

        for id in overrides {
            if let Err(e) = self.terminate(id).await {
                error!("Failed to terminate overridden scope instance {}: {}", id, e);
                continue;
            }
            if let Err(e) = self.reap(id).await {
                warn!("Reap of overridden scope instance {} deferred: {}", id, e);
            }
        }
        Ok(activated)
    }

    /// Undo a failed activation
    async fn rollback(&self, registered: &[Protection], persisted: &[Persisted]) {
        let unregistrations = registered.iter().map(|protection| async move {
            match self.selection.blocker(protection.blocker_id()) {
                Some(blocker) => {
                    if let Err(e) = blocker.unregister_protection(protection).await {
                        error!("Failed to unregister protection {}: {}", protection.id(), e);
                    }
                }
                None => error!("Blocker {} vanished during rollback", protection.blocker_id()),
            }
            if let Err(e) = self.protections.delete_protection(protection.scope_instance_id()).await {
                error!("Failed to drop protection record {}: {}", protection.id(), e);
            }
        });
        join_all(unregistrations).await;

        for record in persisted {
            match record {
                Persisted::Created(scope) => {
                    if let Err(e) = self
                        .store
                        .delete(
                            scope.customer_id,
                            &scope.client_identifier,
                            scope.mitigation_id,
                            scope.scope_instance_id,
                        )
                        .await
                    {
                        error!("Failed to delete scope instance {}: {}", scope.scope_instance_id, e);
                    }
                }
                Persisted::Replaced(scope) => {
                    // the old protection is already gone
                    let mut terminated = scope.clone();
                    terminated.status = MitigationStatus::Terminated;
                    if let Err(e) = self.store.update(&terminated).await {
                        error!("Failed to terminate scope instance {}: {}", scope.scope_instance_id, e);
                    }
                    self.registry.remove(scope.scope_instance_id).await;
                    self.registry.schedule_reap(scope.scope_instance_id).await;
                }
            }
        }
    }
}
