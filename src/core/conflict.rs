//! Conflict resolution between a candidate scope and the live mitigations.
//!
//! The resolver is a pure function over already resolved target sets, so the
//! engine can fetch aliases once and the check stays cheap to benchmark.

use chrono::{DateTime, Utc};
use log::debug;

use crate::core::scope::{ConflictCause, ConflictInformation, ConflictScope, MitigationScope, ScopeInstanceId};
use crate::core::target::ResolvedTargets;

/// A scope together with its alias-expanded targets
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    pub scope: MitigationScope,
    pub targets: ResolvedTargets,
}

impl ResolvedScope {
    pub fn new(scope: MitigationScope, targets: ResolvedTargets) -> Self {
        Self { scope, targets }
    }
}

/// Result of checking one candidate against the live scopes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlapOutcome {
    /// Same-owner scopes to terminate once the candidate is accepted
    pub overrides: Vec<ScopeInstanceId>,
    /// First hard conflict found, if any
    pub conflict: Option<ConflictInformation>,
}

impl OverlapOutcome {
    pub fn overlaps(&self) -> bool {
        self.conflict.is_some() || !self.overrides.is_empty()
    }
}

/// Check a candidate against every live scope.
///
/// `is_new` is true when no prior instance of the candidate's mitigation is
/// being replaced; only new mitigations are subject to the cuid check.
pub fn check_overlap(
    candidate: &ResolvedScope,
    existing: &[ResolvedScope],
    is_new: bool,
    now: DateTime<Utc>,
) -> OverlapOutcome {
    let mut outcome = OverlapOutcome::default();
    let live: Vec<&ResolvedScope> = existing
        .iter()
        .filter(|other| other.scope.is_live(now))
        .filter(|other| !other.scope.same_mitigation(&candidate.scope))
        .collect();

    if is_new {
        let collision = live.iter().find(|other| {
            other.scope.client_identifier == candidate.scope.client_identifier
                && other.scope.customer_id != candidate.scope.customer_id
        });
        if let Some(other) = collision {
            debug!(
                "cuid {} already used by another customer (mitigation {})",
                candidate.scope.client_identifier, other.scope.mitigation_id
            );
            outcome.conflict = Some(ConflictInformation::rejected(
                ConflictCause::CuidCollision,
                ConflictScope {
                    mitigation_id: other.scope.mitigation_id,
                    client_identifier: other.scope.client_identifier.clone(),
                    alias_name: Vec::new(),
                },
            ));
            return outcome;
        }
    }

    for other in live {
        let overlap = match candidate.targets.overlap(&other.targets) {
            Some(overlap) => overlap,
            None => continue,
        };

        if !other.scope.same_owner(&candidate.scope) || overlap.involves_alias() {
            debug!(
                "mitigation {} of {} overlaps mitigation {} of {}",
                candidate.scope.mitigation_id,
                candidate.scope.client_identifier,
                other.scope.mitigation_id,
                other.scope.client_identifier
            );
            outcome.conflict = Some(ConflictInformation::rejected(
                ConflictCause::OverlappingTargets,
                ConflictScope {
                    mitigation_id: other.scope.mitigation_id,
                    client_identifier: other.scope.client_identifier.clone(),
                    alias_name: overlap.alias_names(),
                },
            ));
            outcome.overrides.clear();
            return outcome;
        }

        debug!(
            "mitigation {} overrides mitigation {} (scope instance {})",
            candidate.scope.mitigation_id, other.scope.mitigation_id, other.scope.scope_instance_id
        );
        outcome.overrides.push(other.scope.scope_instance_id);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alias::Alias;
    use crate::core::scope::{CustomerId, MitigationStatus, ScopeInput, INDEFINITE_LIFETIME};
    use crate::core::target::{parse_prefix, TargetSpec};
    use chrono::Duration;

    fn resolved(
        customer_id: CustomerId,
        cuid: &str,
        mid: i64,
        instance: ScopeInstanceId,
        prefixes: &[&str],
        aliases: &[Alias],
    ) -> ResolvedScope {
        let input = ScopeInput {
            mitigation_id: mid,
            target_prefix: prefixes.iter().map(|p| p.to_string()).collect(),
            alias_name: aliases.iter().map(|a| a.name.clone()).collect(),
            lifetime: Some(3600),
            ..Default::default()
        };
        let mut scope = MitigationScope::from_input(customer_id, cuid, None, &input, Utc::now()).unwrap();
        scope.scope_instance_id = instance;
        let targets = ResolvedTargets::new(&scope.targets, aliases);
        ResolvedScope::new(scope, targets)
    }

    fn alias(name: &str, prefix: &str) -> Alias {
        Alias {
            name: name.to_string(),
            targets: TargetSpec {
                prefixes: vec![parse_prefix(prefix).unwrap()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_no_overlap_no_outcome() {
        let candidate = resolved(1, "a", 1, 0, &["192.0.2.0/24"], &[]);
        let existing = vec![resolved(2, "b", 1, 1, &["198.51.100.0/24"], &[])];
        let outcome = check_overlap(&candidate, &existing, true, Utc::now());
        assert!(!outcome.overlaps());
    }

    #[test]
    fn test_third_party_overlap_is_rejected() {
        let candidate = resolved(2, "b", 9, 0, &["192.0.2.128/25"], &[]);
        let existing = vec![resolved(1, "a", 1, 1, &["192.0.2.0/24"], &[])];
        let outcome = check_overlap(&candidate, &existing, true, Utc::now());

        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.conflict_cause, ConflictCause::OverlappingTargets);
        let scope = conflict.conflict_scope.unwrap();
        assert_eq!(scope.mitigation_id, 1);
        assert_eq!(scope.client_identifier, "a");
        assert!(outcome.overrides.is_empty());
    }

    #[test]
    fn test_same_owner_overlap_is_override() {
        let candidate = resolved(1, "a", 2, 0, &["192.0.2.0/25"], &[]);
        let existing = vec![
            resolved(1, "a", 1, 10, &["192.0.2.0/24"], &[]),
            resolved(1, "a", 3, 11, &["203.0.113.0/24"], &[]),
        ];
        let outcome = check_overlap(&candidate, &existing, true, Utc::now());
        assert!(outcome.conflict.is_none());
        assert_eq!(outcome.overrides, vec![10]);
    }

    #[test]
    fn test_same_owner_alias_overlap_is_conflict() {
        let web = alias("web", "192.0.2.0/24");
        let candidate = resolved(1, "a", 2, 0, &[], &[web]);
        let existing = vec![resolved(1, "a", 1, 10, &["192.0.2.10/32"], &[])];
        let outcome = check_overlap(&candidate, &existing, true, Utc::now());

        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.conflict_cause, ConflictCause::OverlappingTargets);
        assert_eq!(conflict.conflict_scope.unwrap().alias_name, vec!["web".to_string()]);
    }

    #[test]
    fn test_cuid_collision_only_for_new_mitigations() {
        let candidate = resolved(2, "shared", 1, 0, &["203.0.113.0/24"], &[]);
        let existing = vec![resolved(1, "shared", 7, 1, &["192.0.2.0/24"], &[])];

        let outcome = check_overlap(&candidate, &existing, true, Utc::now());
        assert_eq!(outcome.conflict.unwrap().conflict_cause, ConflictCause::CuidCollision);

        let outcome = check_overlap(&candidate, &existing, false, Utc::now());
        assert!(outcome.conflict.is_none());
    }

    #[test]
    fn test_own_mitigation_is_ignored() {
        let candidate = resolved(1, "a", 1, 5, &["192.0.2.0/24"], &[]);
        let existing = vec![resolved(1, "a", 1, 5, &["192.0.2.0/24"], &[])];
        let outcome = check_overlap(&candidate, &existing, false, Utc::now());
        assert!(!outcome.overlaps());
    }

    #[test]
    fn test_expired_and_terminated_scopes_are_excluded() {
        let candidate = resolved(2, "b", 1, 0, &["192.0.2.0/24"], &[]);
        let mut expired = resolved(1, "a", 1, 1, &["192.0.2.0/24"], &[]);
        expired.scope.lifetime = 5;
        expired.scope.last_modified_at = Utc::now() - Duration::seconds(60);
        let mut terminated = resolved(1, "a", 2, 2, &["192.0.2.0/24"], &[]);
        terminated.scope.status = MitigationStatus::Terminated;

        let outcome = check_overlap(&candidate, &[expired, terminated], true, Utc::now());
        assert!(!outcome.overlaps());
    }

    #[test]
    fn test_indefinite_scope_always_counts() {
        let candidate = resolved(2, "b", 1, 0, &["192.0.2.0/24"], &[]);
        let mut forever = resolved(1, "a", 1, 1, &["192.0.2.0/24"], &[]);
        forever.scope.lifetime = INDEFINITE_LIFETIME;
        forever.scope.last_modified_at = Utc::now() - Duration::days(400);

        let outcome = check_overlap(&candidate, &[forever], true, Utc::now());
        assert!(outcome.conflict.is_some());
    }

    #[test]
    fn test_conflict_discards_pending_overrides() {
        let candidate = resolved(1, "a", 3, 0, &["192.0.2.0/24"], &[]);
        let existing = vec![
            resolved(1, "a", 1, 10, &["192.0.2.0/24"], &[]),
            resolved(2, "b", 1, 11, &["192.0.2.0/24"], &[]),
        ];
        let outcome = check_overlap(&candidate, &existing, false, Utc::now());
        assert!(outcome.conflict.is_some());
        assert!(outcome.overrides.is_empty());
    }
}
